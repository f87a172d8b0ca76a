use std::borrow::Cow;
use std::fs::File;
use std::io::{self, Write};
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::time::Duration;

use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};

use crate::config::HookConfig;
use crate::error::{HookError, Result};
use crate::hook::fd::{poll_readable, set_nonblocking};
use crate::hook::HookId;
use crate::models::options::{Options, ProcessOptions};
use crate::models::task::{ProcessStatus, TaskId, TaskKind};
use crate::process::buffer::{OutputBuffers, Stream};
use crate::process::child::{self, ChildFn, ChildProgram};
use crate::process::pipes::{self, ParentEnds};
use crate::process::reader::{read_chunk, ReadOutcome};
use crate::supervisor::{start_supervisor, HookTarget, Registry, SupervisedTask, TickOutcome};
use crate::transfer::TransferSettings;

/// What a process callback receives.
#[derive(Debug, Clone, Copy)]
pub struct ProcessOutput<'a> {
    pub command: &'a str,
    pub status: ProcessStatus,
    pub stdout: Option<&'a [u8]>,
    pub stderr: Option<&'a [u8]>,
}

impl<'a> ProcessOutput<'a> {
    pub fn stdout_text(&self) -> Option<Cow<'a, str>> {
        self.stdout.map(String::from_utf8_lossy)
    }

    pub fn stderr_text(&self) -> Option<Cow<'a, str>> {
        self.stderr.map(String::from_utf8_lossy)
    }
}

pub type ProcessCallback = Box<dyn FnMut(&ProcessOutput<'_>)>;

pub struct ProcessLaunch {
    pub owner: String,
    pub command: String,
    pub options: Options,
    pub timeout_ms: u64,
    pub function: Option<ChildFn>,
}

enum OutputPipe {
    Open { fd: OwnedFd, watch: HookId },
    Closed,
    Detached,
}

impl OutputPipe {
    fn watch(fd: Option<OwnedFd>, target: HookTarget, registry: &mut Registry) -> Self {
        let Some(fd) = fd else {
            return OutputPipe::Detached;
        };
        if let Err(err) = set_nonblocking(fd.as_fd()) {
            warn!("cannot make pipe {} non-blocking: {}", fd.as_raw_fd(), err);
        }
        let watch = registry.hook_fd(fd.as_raw_fd(), target);
        OutputPipe::Open { fd, watch }
    }

    fn raw_fd(&self) -> Option<RawFd> {
        match self {
            OutputPipe::Open { fd, .. } => Some(fd.as_raw_fd()),
            _ => None,
        }
    }

    fn close(&mut self, registry: &mut Registry) {
        if let OutputPipe::Open { watch, .. } = self {
            registry.unhook(*watch);
            *self = OutputPipe::Closed;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChildState {
    Running(Pid),
    Terminated,
}

pub struct ProcessTask {
    id: TaskId,
    owner: String,
    command: String,
    timeout_ms: u64,
    callback: ProcessCallback,
    stdin: Option<File>,
    stdout: OutputPipe,
    stderr: OutputPipe,
    child: ChildState,
    buffers: OutputBuffers,
    scratch: Vec<u8>,
    timer: Option<HookId>,
    drain_max_iterations: usize,
    deleted: bool,
}

fn report_setup_error(callback: &mut ProcessCallback, command: &str, message: &str) {
    callback(&ProcessOutput {
        command,
        status: ProcessStatus::Error,
        stdout: None,
        stderr: Some(message.as_bytes()),
    });
}

impl ProcessTask {
    /// Forks the child and hooks its output. On failure the callback gets
    /// a single error status and nothing stays open.
    pub fn start(
        id: TaskId,
        launch: ProcessLaunch,
        mut callback: ProcessCallback,
        registry: &mut Registry,
        config: &HookConfig,
    ) -> Result<Self> {
        let ProcessLaunch {
            owner,
            command,
            options,
            timeout_ms,
            function,
        } = launch;
        let parsed = ProcessOptions::from_options(&options, config.buffer_capacity);
        let settings = TransferSettings::from_config(config, timeout_ms);
        let program = ChildProgram::prepare(&command, &parsed, &options, settings, function);

        let (parent, child_ends) = match pipes::allocate(&parsed) {
            Ok(ends) => ends,
            Err(err) => {
                error!("process task {}: pipe error: {}", id, err);
                report_setup_error(&mut callback, &command, &format!("pipe error: {}", err));
                return Err(HookError::Pipe(err));
            }
        };

        // pending buffered output would otherwise be written twice
        let _ = io::stdout().flush();
        let _ = io::stderr().flush();

        let pid = match unsafe { fork() } {
            Ok(ForkResult::Child) => child::run_child(parent, child_ends, program),
            Ok(ForkResult::Parent { child: pid }) => pid,
            Err(errno) => {
                let err = io::Error::from(errno);
                drop(parent);
                drop(child_ends);
                error!("process task {}: fork error: {}", id, err);
                report_setup_error(&mut callback, &command, &format!("fork error: {}", err));
                return Err(HookError::Fork(err));
            }
        };

        drop(child_ends);
        drop(program);

        let ParentEnds {
            stdin,
            stdout,
            stderr,
        } = parent;
        let stdout = OutputPipe::watch(stdout, HookTarget::Output(id, Stream::Stdout), registry);
        let stderr = OutputPipe::watch(stderr, HookTarget::Output(id, Stream::Stderr), registry);
        let timer = start_supervisor(registry, id, timeout_ms, config.tick_interval);

        info!(
            "process task {} started: command \"{}\", child pid {}, timeout {} ms",
            id, command, pid, timeout_ms
        );

        Ok(ProcessTask {
            id,
            owner,
            command,
            timeout_ms,
            callback,
            stdin: stdin.map(File::from),
            stdout,
            stderr,
            child: ChildState::Running(pid),
            buffers: OutputBuffers::new(config.buffer_capacity, parsed.buffer_flush),
            scratch: vec![0; config.read_chunk.max(1)],
            timer: Some(timer),
            drain_max_iterations: config.drain_max_iterations,
            deleted: false,
        })
    }

    pub fn pid(&self) -> Option<Pid> {
        match self.child {
            ChildState::Running(pid) => Some(pid),
            ChildState::Terminated => None,
        }
    }

    /// Handles one readiness notification on a child output pipe.
    pub fn read_stream(&mut self, stream: Stream, registry: &mut Registry) {
        let pipe = match stream {
            Stream::Stdout => &mut self.stdout,
            Stream::Stderr => &mut self.stderr,
        };
        if self.deleted {
            pipe.close(registry);
            return;
        }
        let outcome = match pipe {
            OutputPipe::Open { fd, .. } => read_chunk(fd.as_fd(), &mut self.scratch),
            _ => return,
        };

        match outcome {
            ReadOutcome::Data(n) => {
                let command = &self.command;
                let callback = &mut self.callback;
                self.buffers.push(stream, &self.scratch[..n], |stdout, stderr| {
                    callback(&ProcessOutput {
                        command,
                        status: ProcessStatus::Running,
                        stdout,
                        stderr,
                    })
                });
            }
            ReadOutcome::Eof => {
                debug!("process task {}: {:?} closed", self.id, stream);
                pipe.close(registry);
            }
            ReadOutcome::WouldBlock => {}
        }
    }

    /// Reads what a finished child left in its pipes, bounded so a child
    /// that keeps a pipe busy cannot stall the loop.
    fn read_until_eof(&mut self, registry: &mut Registry) {
        for _ in 0..self.drain_max_iterations {
            let open: Vec<(Stream, RawFd)> = [
                (Stream::Stdout, self.stdout.raw_fd()),
                (Stream::Stderr, self.stderr.raw_fd()),
            ]
            .into_iter()
            .filter_map(|(stream, fd)| fd.map(|fd| (stream, fd)))
            .collect();
            if open.is_empty() {
                break;
            }

            let raw: Vec<RawFd> = open.iter().map(|(_, fd)| *fd).collect();
            let ready = match poll_readable(&raw, Some(Duration::ZERO)) {
                Ok(ready) => ready,
                Err(err) => {
                    warn!("process task {}: poll error while draining: {}", self.id, err);
                    break;
                }
            };
            if !ready.contains(&true) {
                break;
            }
            for ((stream, _), is_ready) in open.into_iter().zip(ready) {
                if is_ready {
                    self.read_stream(stream, registry);
                }
            }
        }
    }

    fn send_buffers(&mut self, status: ProcessStatus) {
        let command = &self.command;
        let callback = &mut self.callback;
        self.buffers.flush(|stdout, stderr| {
            callback(&ProcessOutput {
                command,
                status,
                stdout,
                stderr,
            })
        });
    }

    pub fn write_stdin(&mut self, data: &[u8]) -> Result<()> {
        if self.deleted {
            return Err(HookError::NoStdin(self.id));
        }
        let stdin = self.stdin.as_mut().ok_or(HookError::NoStdin(self.id))?;
        stdin.write_all(data)?;
        Ok(())
    }

    pub fn close_stdin(&mut self) -> Result<()> {
        if self.deleted || self.stdin.take().is_none() {
            return Err(HookError::NoStdin(self.id));
        }
        debug!("process task {}: stdin closed", self.id);
        Ok(())
    }

    pub fn send_signal(&mut self, signal: Signal) -> Result<()> {
        let pid = match self.child {
            ChildState::Running(pid) if !self.deleted => pid,
            _ => return Err(HookError::NotRunning(self.id)),
        };
        kill(pid, signal).map_err(|errno| {
            error!("error sending signal {} to pid {}: {}", signal, pid, errno);
            HookError::Io(errno.into())
        })
    }
}

impl SupervisedTask for ProcessTask {
    fn owner(&self) -> &str {
        &self.owner
    }

    fn kind(&self) -> TaskKind {
        TaskKind::Process
    }

    fn description(&self) -> String {
        format!(
            "command: \"{}\", child pid: {}",
            self.command,
            self.pid().map_or(0, Pid::as_raw)
        )
    }

    fn is_deleted(&self) -> bool {
        self.deleted
    }

    fn mark_deleted(&mut self) {
        self.deleted = true;
    }

    fn tick(&mut self, remaining_calls: Option<u32>, registry: &mut Registry) -> TickOutcome {
        if self.deleted {
            return TickOutcome::Pending;
        }
        let pid = match self.child {
            ChildState::Running(pid) => pid,
            ChildState::Terminated => return TickOutcome::Finished,
        };

        if remaining_calls == Some(0) {
            warn!(
                "end of command '{}', timeout reached ({:.3}s)",
                self.command,
                self.timeout_ms as f64 / 1000.0
            );
            self.send_buffers(ProcessStatus::Error);
            let _ = kill(pid, Signal::SIGKILL);
            return TickOutcome::Finished;
        }

        let result = match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => ProcessStatus::Exited(code),
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                warn!("command '{}' terminated by signal {}", self.command, signal);
                ProcessStatus::Error
            }
            Ok(_) | Err(Errno::EINTR) => return TickOutcome::Pending,
            Err(errno) => {
                error!("process task {}: waitpid({}) failed: {}", self.id, pid, errno);
                ProcessStatus::Error
            }
        };

        self.child = ChildState::Terminated;
        self.read_until_eof(registry);
        self.send_buffers(result);
        info!("process task {} ended: {:?}", self.id, result);
        TickOutcome::Finished
    }

    fn release(&mut self, registry: &mut Registry) {
        self.stdout.close(registry);
        self.stderr.close(registry);
        if let Some(timer) = self.timer.take() {
            registry.unhook(timer);
        }
        if let ChildState::Running(pid) = self.child {
            let _ = kill(pid, Signal::SIGKILL);
            registry.schedule_reap(pid);
            self.child = ChildState::Terminated;
        }
        self.stdin = None;
        self.buffers.release();
        self.scratch = Vec::new();
    }
}
