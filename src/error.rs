use std::io;

use thiserror::Error;

use crate::models::task::TaskId;

#[derive(Error, Debug)]
pub enum HookError {
    #[error("empty command")]
    EmptyCommand,

    #[error("empty URL")]
    EmptyUrl,

    #[error("pipe error: {0}")]
    Pipe(#[source] io::Error),

    #[error("fork error: {0}")]
    Fork(#[source] io::Error),

    #[error("error creating transfer thread: {0}")]
    ThreadSpawn(#[source] io::Error),

    #[error("task {0} not found")]
    UnknownTask(TaskId),

    #[error("task {0} has no open stdin pipe")]
    NoStdin(TaskId),

    #[error("task {0} has no running child")]
    NotRunning(TaskId),

    #[error("task {0} is not a process task")]
    NotProcess(TaskId),

    #[error("invalid signal: {0}")]
    InvalidSignal(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, HookError>;
