//! Lifecycle shared by process and URL tasks: one supervisor timer per
//! task, ticked until the task reports it is finished, then an idempotent
//! release of everything the task owns.

use std::time::Duration;

use crate::hook::timer::supervisor_schedule;
use crate::hook::{HookId, HookRegistry};
use crate::models::task::{TaskId, TaskInfo, TaskKind};
use crate::process::buffer::Stream;
use crate::process::task::ProcessTask;
use crate::worker::url_task::UrlTask;

/// Context attached to every hook a task registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookTarget {
    Supervise(TaskId),
    Output(TaskId, Stream),
}

pub type Registry = HookRegistry<HookTarget>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Pending,
    /// The terminal callback has been delivered; release the task.
    Finished,
}

pub trait SupervisedTask {
    fn owner(&self) -> &str;

    fn kind(&self) -> TaskKind;

    fn description(&self) -> String;

    fn is_deleted(&self) -> bool;

    /// Suppresses further callbacks and I/O until the task is released.
    fn mark_deleted(&mut self);

    /// One supervisor tick. `remaining_calls` is `Some(0)` on the tick
    /// where the timeout is reached.
    fn tick(&mut self, remaining_calls: Option<u32>, registry: &mut Registry) -> TickOutcome;

    /// Releases hooks, descriptors, children and threads. Safe to call
    /// more than once.
    fn release(&mut self, registry: &mut Registry);
}

/// Registers the supervisor timer for a task with the given timeout.
pub fn start_supervisor(registry: &mut Registry, id: TaskId, timeout_ms: u64, tick: Duration) -> HookId {
    let (interval, max_calls) = supervisor_schedule(timeout_ms, tick);
    registry.hook_timer(interval, max_calls, HookTarget::Supervise(id))
}

pub enum Task {
    Process(ProcessTask),
    Url(UrlTask),
}

impl Task {
    pub fn supervised(&self) -> &dyn SupervisedTask {
        match self {
            Task::Process(task) => task,
            Task::Url(task) => task,
        }
    }

    pub fn supervised_mut(&mut self) -> &mut dyn SupervisedTask {
        match self {
            Task::Process(task) => task,
            Task::Url(task) => task,
        }
    }

    pub fn info(&self, id: TaskId) -> TaskInfo {
        let task = self.supervised();
        TaskInfo {
            id,
            owner: task.owner().to_string(),
            kind: task.kind(),
            description: task.description(),
            deleted: task.is_deleted(),
        }
    }
}
