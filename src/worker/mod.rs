pub mod url_task;
pub mod worker;
