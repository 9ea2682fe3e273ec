//! Task execution.
//!
//! This module provides the bounded worker pool task bodies run on, and
//! the external command task body used by the binary.

mod command;
mod pool;

pub use command::{CommandTask, CommandTaskBuilder};
pub use pool::{TaskResult, WorkerPool};
