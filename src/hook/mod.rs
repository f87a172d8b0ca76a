//! Minimal single-threaded hook registry: bounded repeating timers,
//! level-triggered readable-fd watches and deferred cleanup of children
//! and threads that were abandoned while still running.
//!
//! The registry never calls back into user code. [`HookRegistry::poll`]
//! waits for the next batch of activity and returns it as [`HookEvent`]s
//! carrying the context value given at registration; the owner dispatches
//! them and must skip events whose hook is no longer registered (see
//! [`HookRegistry::is_hooked`]).

pub mod fd;
pub mod timer;

use std::collections::BTreeMap;
use std::io;
use std::os::fd::RawFd;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use timer::Timer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HookId(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookEvent<T> {
    Timer {
        hook: HookId,
        context: T,
        /// Calls left after this one; `None` for an unlimited timer.
        remaining_calls: Option<u32>,
    },
    Readable {
        hook: HookId,
        fd: RawFd,
        context: T,
    },
}

impl<T> HookEvent<T> {
    pub fn hook(&self) -> HookId {
        match self {
            HookEvent::Timer { hook, .. } | HookEvent::Readable { hook, .. } => *hook,
        }
    }
}

struct FdWatch<T> {
    fd: RawFd,
    context: T,
}

enum Orphan {
    Child {
        pid: Pid,
        attempts_left: u32,
        next_check: Instant,
    },
    Thread {
        handle: JoinHandle<()>,
        next_check: Instant,
    },
}

impl Orphan {
    fn next_check(&self) -> Instant {
        match self {
            Orphan::Child { next_check, .. } | Orphan::Thread { next_check, .. } => *next_check,
        }
    }
}

pub struct HookRegistry<T> {
    next_id: u64,
    timers: BTreeMap<HookId, Timer<T>>,
    fds: BTreeMap<HookId, FdWatch<T>>,
    orphans: Vec<Orphan>,
    reap_interval: Duration,
    reap_attempts: u32,
}

impl<T: Clone> HookRegistry<T> {
    pub fn new(reap_interval: Duration, reap_attempts: u32) -> Self {
        HookRegistry {
            next_id: 0,
            timers: BTreeMap::new(),
            fds: BTreeMap::new(),
            orphans: Vec::new(),
            reap_interval,
            reap_attempts: reap_attempts.max(1),
        }
    }

    fn allocate_id(&mut self) -> HookId {
        self.next_id += 1;
        HookId(self.next_id)
    }

    /// Registers a timer firing every `interval`, at most `max_calls` times.
    /// The timer unregisters itself after its last call.
    pub fn hook_timer(&mut self, interval: Duration, max_calls: Option<u32>, context: T) -> HookId {
        let id = self.allocate_id();
        self.timers.insert(id, Timer::new(interval, max_calls, context));
        id
    }

    /// Watches `fd` for readability. The caller keeps ownership of the
    /// descriptor and must unhook before closing it.
    pub fn hook_fd(&mut self, fd: RawFd, context: T) -> HookId {
        let id = self.allocate_id();
        self.fds.insert(id, FdWatch { fd, context });
        id
    }

    pub fn unhook(&mut self, id: HookId) {
        if self.timers.remove(&id).is_none() {
            self.fds.remove(&id);
        }
    }

    pub fn is_hooked(&self, id: HookId) -> bool {
        // an exhausted timer stays hooked until its last event is dispatched
        self.fds.contains_key(&id) || self.timers.contains_key(&id)
    }

    pub fn hook_count(&self) -> usize {
        self.fds.len() + self.timers.values().filter(|t| !t.exhausted).count()
    }

    /// Collects the exit status of `pid` later, so a killed child that has
    /// not exited yet does not linger as a zombie.
    pub fn schedule_reap(&mut self, pid: Pid) {
        self.orphans.push(Orphan::Child {
            pid,
            attempts_left: self.reap_attempts,
            next_check: Instant::now() + self.reap_interval,
        });
    }

    /// Joins `handle` once its thread has finished.
    pub fn schedule_join(&mut self, handle: JoinHandle<()>) {
        self.orphans.push(Orphan::Thread {
            handle,
            next_check: Instant::now() + self.reap_interval,
        });
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }

    /// Waits at most `max_wait` for due timers or readable descriptors and
    /// returns them, timers first.
    pub fn poll(&mut self, max_wait: Duration) -> io::Result<Vec<HookEvent<T>>> {
        self.timers.retain(|_, timer| !timer.exhausted);

        let now = Instant::now();
        let mut wait = max_wait;
        for timer in self.timers.values() {
            wait = wait.min(timer.next_exec.saturating_duration_since(now));
        }
        for orphan in &self.orphans {
            wait = wait.min(orphan.next_check().saturating_duration_since(now));
        }

        let watched: Vec<(HookId, RawFd)> =
            self.fds.iter().map(|(id, watch)| (*id, watch.fd)).collect();
        let raw: Vec<RawFd> = watched.iter().map(|(_, fd)| *fd).collect();
        let ready = fd::poll_readable(&raw, Some(wait))?;

        let now = Instant::now();
        let mut events = Vec::new();
        for (id, timer) in self.timers.iter_mut() {
            if timer.is_due(now) {
                let remaining_calls = timer.fire(now);
                events.push(HookEvent::Timer {
                    hook: *id,
                    context: timer.context.clone(),
                    remaining_calls,
                });
            }
        }
        for ((id, fd), is_ready) in watched.into_iter().zip(ready) {
            if !is_ready {
                continue;
            }
            if let Some(watch) = self.fds.get(&id) {
                events.push(HookEvent::Readable {
                    hook: id,
                    fd,
                    context: watch.context.clone(),
                });
            }
        }

        self.collect_orphans(now);
        Ok(events)
    }

    fn collect_orphans(&mut self, now: Instant) {
        let interval = self.reap_interval;
        let pending = std::mem::take(&mut self.orphans);
        for orphan in pending {
            if orphan.next_check() > now {
                self.orphans.push(orphan);
                continue;
            }
            match orphan {
                Orphan::Child {
                    pid,
                    attempts_left,
                    ..
                } => {
                    let still_alive =
                        matches!(waitpid(pid, Some(WaitPidFlag::WNOHANG)), Ok(WaitStatus::StillAlive));
                    if !still_alive {
                        debug!("reaped child {}", pid);
                    } else if attempts_left > 1 {
                        self.orphans.push(Orphan::Child {
                            pid,
                            attempts_left: attempts_left - 1,
                            next_check: now + interval,
                        });
                    } else {
                        warn!("child {} still not reaped, giving up", pid);
                    }
                }
                Orphan::Thread { handle, .. } => {
                    if handle.is_finished() {
                        if handle.join().is_err() {
                            warn!("abandoned transfer thread panicked");
                        }
                    } else {
                        self.orphans.push(Orphan::Thread {
                            handle,
                            next_check: now + interval,
                        });
                    }
                }
            }
        }
    }
}

/// Children still pending a reap were already killed, so waiting for them
/// here is short. Unfinished threads are detached.
impl<T> Drop for HookRegistry<T> {
    fn drop(&mut self) {
        for orphan in self.orphans.drain(..) {
            if let Orphan::Child { pid, .. } = orphan {
                loop {
                    match waitpid(pid, None) {
                        Err(Errno::EINTR) => continue,
                        Ok(_) => debug!("reaped child {} on shutdown", pid),
                        Err(e) => debug!("child {} already gone: {}", pid, e),
                    }
                    break;
                }
            }
        }
    }
}
