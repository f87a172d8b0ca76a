use nix::sys::signal::Signal;

use super::task::TaskId;

/// Requests that can be queued while the manager is busy dispatching
/// (typically from inside a task callback).
#[derive(Debug)]
pub enum TaskMessage {
    Close(TaskId),
    Stdin(TaskId, Vec<u8>),
    CloseStdin(TaskId),
    Signal(TaskId, Signal),
}
