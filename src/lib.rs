//! Asynchronous external tasks driven from a single-threaded event loop:
//! child processes whose output is captured through pipes, and URL
//! transfers running on worker threads. Each task is supervised by a timer
//! that enforces its timeout and reports completion through a callback.

pub mod app;
pub mod config;
pub mod error;
pub mod hook;
pub mod manager;
pub mod models;
pub mod process;
pub mod supervisor;
pub mod transfer;
pub mod worker;

pub use config::HookConfig;
pub use error::{HookError, Result};
pub use manager::task_manager::TaskManager;
pub use models::message::TaskMessage;
pub use models::options::{Options, OutputMap};
pub use models::task::{ProcessStatus, TaskId, TaskInfo, TaskKind};
pub use nix::sys::signal::Signal;
pub use process::task::ProcessOutput;
