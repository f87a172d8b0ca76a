pub mod buffer;
pub mod child;
pub mod pipes;
pub mod reader;
pub mod signal;
pub mod task;
