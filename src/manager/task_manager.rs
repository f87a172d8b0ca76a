use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error, info};
use nix::sys::signal::Signal;

use crate::config::HookConfig;
use crate::error::{HookError, Result};
use crate::hook::HookEvent;
use crate::models::message::TaskMessage;
use crate::models::options::{Options, OutputMap};
use crate::models::task::{TaskId, TaskInfo};
use crate::process::buffer::Stream;
use crate::process::signal::parse_signal;
use crate::process::task::{ProcessLaunch, ProcessOutput, ProcessTask};
use crate::supervisor::{HookTarget, Registry, Task, TickOutcome};
use crate::worker::url_task::{UrlLaunch, UrlTask};

/// Owns every running task and drives them from a single thread.
///
/// Nothing happens in the background: callbacks run from inside
/// [`TaskManager::run_once`]. A callback cannot borrow the manager, so it
/// queues requests through [`TaskManager::sender`] instead; they are
/// applied before the next event is dispatched.
pub struct TaskManager {
    config: HookConfig,
    registry: Registry,
    tasks: BTreeMap<TaskId, Task>,
    sender: Sender<TaskMessage>,
    receiver: Receiver<TaskMessage>,
    next_id: u64,
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskManager {
    pub fn new() -> Self {
        Self::with_config(HookConfig::default())
    }

    pub fn with_config(config: HookConfig) -> Self {
        let (sender, receiver) = unbounded();
        TaskManager {
            registry: Registry::new(config.reap_interval, config.reap_attempts),
            config,
            tasks: BTreeMap::new(),
            sender,
            receiver,
            next_id: 0,
        }
    }

    pub fn config(&self) -> &HookConfig {
        &self.config
    }

    pub fn sender(&self) -> Sender<TaskMessage> {
        self.sender.clone()
    }

    fn allocate_id(&mut self) -> TaskId {
        self.next_id += 1;
        TaskId(self.next_id)
    }

    /// Runs `command` in a child process. The callback receives partial
    /// output with `ProcessStatus::Running` and exactly one terminal call.
    pub fn launch_process<F>(
        &mut self,
        owner: &str,
        command: &str,
        options: Options,
        timeout_ms: u64,
        callback: F,
    ) -> Result<TaskId>
    where
        F: FnMut(&ProcessOutput<'_>) + 'static,
    {
        if command.trim().is_empty() {
            return Err(HookError::EmptyCommand);
        }
        self.start_process(
            ProcessLaunch {
                owner: owner.to_string(),
                command: command.to_string(),
                options,
                timeout_ms,
                function: None,
            },
            callback,
        )
    }

    /// Runs `function` in a forked child; its return value is the exit code.
    pub fn launch_function<G, F>(
        &mut self,
        owner: &str,
        name: &str,
        function: G,
        options: Options,
        timeout_ms: u64,
        callback: F,
    ) -> Result<TaskId>
    where
        G: FnOnce() -> i32 + 'static,
        F: FnMut(&ProcessOutput<'_>) + 'static,
    {
        self.start_process(
            ProcessLaunch {
                owner: owner.to_string(),
                command: format!("func:{}", name),
                options,
                timeout_ms,
                function: Some(Box::new(function)),
            },
            callback,
        )
    }

    fn start_process<F>(&mut self, launch: ProcessLaunch, callback: F) -> Result<TaskId>
    where
        F: FnMut(&ProcessOutput<'_>) + 'static,
    {
        let id = self.allocate_id();
        let task = ProcessTask::start(id, launch, Box::new(callback), &mut self.registry, &self.config)?;
        self.tasks.insert(id, Task::Process(task));
        Ok(id)
    }

    /// Fetches `url` on a worker thread; the callback runs once with the
    /// output map.
    pub fn fetch_url<F>(
        &mut self,
        owner: &str,
        url: &str,
        options: Options,
        timeout_ms: u64,
        callback: F,
    ) -> Result<TaskId>
    where
        F: FnMut(&str, &Options, &OutputMap) + 'static,
    {
        if url.trim().is_empty() {
            return Err(HookError::EmptyUrl);
        }
        let id = self.allocate_id();
        let launch = UrlLaunch {
            owner: owner.to_string(),
            url: url.to_string(),
            options,
            timeout_ms,
        };
        let task = UrlTask::start(id, launch, Box::new(callback), &mut self.registry, &self.config)?;
        self.tasks.insert(id, Task::Url(task));
        Ok(id)
    }

    /// Stops a task without invoking its callback again. Returns false if
    /// the task was already gone.
    pub fn close(&mut self, id: TaskId) -> bool {
        let Some(mut task) = self.tasks.remove(&id) else {
            return false;
        };
        let task = task.supervised_mut();
        task.mark_deleted();
        task.release(&mut self.registry);
        info!("task {} closed", id);
        true
    }

    /// Closes every task registered by `owner`.
    pub fn close_owner(&mut self, owner: &str) -> usize {
        let ids: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|(_, task)| task.supervised().owner() == owner)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter().filter(|id| self.close(*id)).count()
    }

    pub fn close_all(&mut self) {
        let ids: Vec<TaskId> = self.tasks.keys().copied().collect();
        for id in ids {
            self.close(id);
        }
    }

    fn process_mut(&mut self, id: TaskId) -> Result<&mut ProcessTask> {
        match self.tasks.get_mut(&id) {
            Some(Task::Process(task)) => Ok(task),
            Some(Task::Url(_)) => Err(HookError::NotProcess(id)),
            None => Err(HookError::UnknownTask(id)),
        }
    }

    /// Writes to the child's stdin; the task must have the `stdin` option.
    pub fn send_stdin(&mut self, id: TaskId, data: &[u8]) -> Result<()> {
        self.process_mut(id)?.write_stdin(data)
    }

    pub fn close_stdin(&mut self, id: TaskId) -> Result<()> {
        self.process_mut(id)?.close_stdin()
    }

    pub fn signal(&mut self, id: TaskId, signal: Signal) -> Result<()> {
        self.process_mut(id)?.send_signal(signal)
    }

    pub fn signal_by_name(&mut self, id: TaskId, name: &str) -> Result<()> {
        let signal = parse_signal(name).ok_or_else(|| HookError::InvalidSignal(name.to_string()))?;
        self.signal(id, signal)
    }

    pub fn tasks(&self) -> Vec<TaskInfo> {
        self.tasks.iter().map(|(id, task)| task.info(*id)).collect()
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.tasks.contains_key(&id)
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Children and threads released while still running and not yet
    /// collected.
    pub fn pending_cleanup(&self) -> usize {
        self.registry.orphan_count()
    }

    /// True once no task is active and nothing is left to clean up.
    pub fn is_idle(&self) -> bool {
        self.tasks.is_empty() && self.registry.orphan_count() == 0
    }

    fn process_messages(&mut self) {
        while let Ok(message) = self.receiver.try_recv() {
            debug!("message: {:?}", message);
            let result = match message {
                TaskMessage::Close(id) => {
                    self.close(id);
                    Ok(())
                }
                TaskMessage::Stdin(id, data) => self.send_stdin(id, &data),
                TaskMessage::CloseStdin(id) => self.close_stdin(id),
                TaskMessage::Signal(id, signal) => self.signal(id, signal),
            };
            if let Err(e) = result {
                error!("Failed to apply queued request: {}", e);
            }
        }
    }

    /// Waits up to `max_wait` for activity and dispatches it. Returns the
    /// number of events handled.
    pub fn run_once(&mut self, max_wait: Duration) -> Result<usize> {
        self.process_messages();
        let events = self.registry.poll(max_wait)?;

        let mut handled = 0;
        for event in events {
            self.process_messages();
            if !self.registry.is_hooked(event.hook()) {
                continue;
            }
            handled += 1;
            match event {
                HookEvent::Timer {
                    context: HookTarget::Supervise(id),
                    remaining_calls,
                    ..
                } => self.supervise(id, remaining_calls),
                HookEvent::Readable {
                    context: HookTarget::Output(id, stream),
                    ..
                } => self.read_output(id, stream),
                other => debug!("unexpected hook event {:?}", other.hook()),
            }
        }
        self.process_messages();
        Ok(handled)
    }

    /// Keeps running until nothing is active or `limit` has elapsed.
    /// Returns whether the manager became idle.
    pub fn run_until_idle(&mut self, limit: Duration) -> Result<bool> {
        let deadline = Instant::now() + limit;
        while !self.is_idle() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let wait = (deadline - now).min(self.config.tick_interval);
            self.run_once(wait)?;
        }
        Ok(self.is_idle())
    }

    fn supervise(&mut self, id: TaskId, remaining_calls: Option<u32>) {
        let Some(task) = self.tasks.get_mut(&id) else {
            return;
        };
        if task.supervised_mut().tick(remaining_calls, &mut self.registry) == TickOutcome::Finished {
            self.finish(id);
        }
    }

    fn read_output(&mut self, id: TaskId, stream: Stream) {
        if let Some(Task::Process(task)) = self.tasks.get_mut(&id) {
            task.read_stream(stream, &mut self.registry);
        }
    }

    fn finish(&mut self, id: TaskId) {
        if let Some(mut task) = self.tasks.remove(&id) {
            let task = task.supervised_mut();
            task.mark_deleted();
            task.release(&mut self.registry);
            debug!("task {} released", id);
        }
    }
}

impl Drop for TaskManager {
    fn drop(&mut self) {
        self.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::task::ProcessStatus;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn empty_command_and_url_are_rejected() {
        let mut manager = TaskManager::new();
        assert!(matches!(
            manager.launch_process("test", "  ", Options::new(), 0, |_| {}),
            Err(HookError::EmptyCommand)
        ));
        assert!(matches!(
            manager.fetch_url("test", "", Options::new(), 0, |_, _, _| {}),
            Err(HookError::EmptyUrl)
        ));
        assert_eq!(manager.task_count(), 0);
    }

    #[test]
    fn unknown_task_requests_fail() {
        let mut manager = TaskManager::new();
        assert!(!manager.close(TaskId(42)));
        assert!(matches!(
            manager.send_stdin(TaskId(42), b"x"),
            Err(HookError::UnknownTask(TaskId(42)))
        ));
        assert!(matches!(
            manager.signal_by_name(TaskId(42), "NOPE"),
            Err(HookError::InvalidSignal(_))
        ));
    }

    #[test]
    fn close_owner_only_touches_that_owner() {
        let mut manager = TaskManager::new();
        let a = manager
            .launch_process("alpha", "sleep 5", Options::new(), 0, |_| {})
            .unwrap();
        let b = manager
            .launch_process("beta", "sleep 5", Options::new(), 0, |_| {})
            .unwrap();
        assert_eq!(manager.close_owner("alpha"), 1);
        assert!(!manager.contains(a));
        assert!(manager.contains(b));
        assert_eq!(manager.tasks().len(), 1);
        assert_eq!(manager.tasks()[0].owner, "beta");
    }

    #[test]
    fn queued_close_suppresses_terminal_callback() {
        let mut manager = TaskManager::new();
        let calls = Rc::new(RefCell::new(Vec::new()));
        let seen = Rc::clone(&calls);
        let id = manager
            .launch_process("test", "sleep 5", Options::new(), 0, move |out| {
                seen.borrow_mut().push(out.status)
            })
            .unwrap();
        manager.sender().send(TaskMessage::Close(id)).unwrap();
        manager.run_once(Duration::from_millis(10)).unwrap();
        assert!(!manager.contains(id));
        assert!(manager.run_until_idle(Duration::from_secs(5)).unwrap());
        assert!(calls.borrow().iter().all(|s| *s == ProcessStatus::Running));
    }

    #[test]
    fn queued_signal_ends_the_process() {
        let mut manager = TaskManager::new();
        let calls = Rc::new(RefCell::new(Vec::new()));
        let seen = Rc::clone(&calls);
        let id = manager
            .launch_process("test", "sleep 5", Options::new(), 0, move |out| {
                seen.borrow_mut().push(out.status)
            })
            .unwrap();
        manager
            .sender()
            .send(TaskMessage::Signal(id, Signal::SIGKILL))
            .unwrap();
        assert!(manager.run_until_idle(Duration::from_secs(5)).unwrap());
        assert_eq!(*calls.borrow(), vec![ProcessStatus::Error]);
    }
}
