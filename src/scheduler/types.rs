//! Scheduler type definitions.
//!
//! This module contains error types, state enums, configuration and tick
//! reports for the scheduler.

use chrono_tz::Tz;
use std::time::Duration;
use thiserror::Error;

use crate::core::schedule::ScheduleError;
use crate::storage::StorageError;

/// Errors that can occur in the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The scheduler was started before being configured.
    #[error("scheduler is not configured; call configure() before start()")]
    NotConfigured,

    /// A task with the same name is already registered.
    #[error("task already registered: {0}")]
    DuplicateTask(String),

    /// The scheduler was started twice.
    #[error("scheduler already started")]
    AlreadyStarted,

    /// Invalid cron expression or timezone.
    #[error("schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// State of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Created, not yet configured.
    Created,
    /// Configured and ready to start.
    Configured,
    /// The tick loop is running.
    Running,
    /// The tick loop has exited.
    Stopped,
}

/// Settings applied by [`Scheduler::configure`](super::Scheduler::configure).
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Timezone cron expressions are evaluated in.
    pub timezone: Tz,
    /// Worker pool capacity, also the batch size.
    pub pool_size: usize,
    /// How long to wait for running task bodies on shutdown.
    pub shutdown_timeout: Duration,
}

impl SchedulerConfig {
    /// Set the timezone.
    pub fn with_timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }

    /// Set the worker pool size.
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Set the graceful shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            timezone: Tz::UTC,
            pool_size: 4,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Outcome of one locked batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Tasks selected for the batch, in dispatch order.
    pub tasks: Vec<String>,
    /// Tasks dispatched to the pool.
    pub ran: Vec<String>,
    /// Tasks dropped after re-checking readiness under the lock.
    pub skipped: Vec<String>,
    /// Set when the transaction failed and the batch was abandoned.
    pub abandoned: bool,
}

/// Outcome of one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Batches in the order they were processed.
    pub batches: Vec<BatchReport>,
}

impl TickReport {
    /// All tasks dispatched during the tick.
    pub fn ran(&self) -> impl Iterator<Item = &str> {
        self.batches
            .iter()
            .flat_map(|batch| batch.ran.iter().map(String::as_str))
    }

    /// Number of tasks dispatched during the tick.
    pub fn ran_count(&self) -> usize {
        self.batches.iter().map(|batch| batch.ran.len()).sum()
    }

    /// Batch sizes, in processing order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.iter().map(|batch| batch.tasks.len()).collect()
    }
}
