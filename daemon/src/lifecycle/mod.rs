//! Process lifecycle: signals and background task supervision

mod shutdown;
mod tasks;

pub use shutdown::ShutdownSignal;
pub use tasks::{TaskHandle, TaskSupervisor};
