use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Process,
    Url,
}

/// Status handed to a process callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Partial output; more callbacks follow.
    Running,
    /// Terminal: the child exited normally with this code.
    Exited(i32),
    /// Terminal: setup failure, timeout or death by signal.
    Error,
}

impl ProcessStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProcessStatus::Running)
    }
}

/// Snapshot of one task, as returned by `TaskManager::tasks`.
#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub id: TaskId,
    pub owner: String,
    pub kind: TaskKind,
    pub description: String,
    pub deleted: bool,
}

impl fmt::Display for TaskInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            TaskKind::Process => "process",
            TaskKind::Url => "url",
        };
        write!(f, "{}\t {} \t {} \t {}", self.id, kind, self.owner, self.description)
    }
}
