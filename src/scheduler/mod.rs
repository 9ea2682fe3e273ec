//! Fleet-coordinated scheduling loop.
//!
//! This module provides the per-process scheduler, the handle used to stop
//! it, and its configuration and report types.

mod engine;
mod handle;
mod types;

pub use engine::{Scheduler, next_tick_delay};
pub use handle::SchedulerHandle;
pub use types::{BatchReport, SchedulerConfig, SchedulerError, SchedulerState, TickReport};
