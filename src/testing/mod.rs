//! Testing utilities for applications embedding dbcron.
//!
//! This module provides helpers for testing scheduled tasks:
//!
//! - [`CountingTask`]: A task that counts its runs
//! - [`FailingTask`]: A task that fails N times then succeeds
//! - [`TestHarness`]: Drives a scheduler tick by tick over in-memory storage
//!   with a pinned clock
//! - [`wait_until`]: Polls a condition until it holds or a timeout expires

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::core::task::{Task, TaskError};
use crate::scheduler::{Scheduler, SchedulerConfig, SchedulerError, TickReport};
use crate::storage::{InMemoryStorage, Storage};

/// A task that counts how many times it ran.
///
/// # Example
///
/// ```
/// use dbcron::testing::CountingTask;
///
/// let task = CountingTask::new();
/// let runs = task.counter();
/// // register `task`, tick, then check `runs`
/// assert_eq!(runs.load(std::sync::atomic::Ordering::SeqCst), 0);
/// ```
#[derive(Clone, Default)]
pub struct CountingTask {
    count: Arc<AtomicU32>,
    delay: Option<Duration>,
}

impl CountingTask {
    /// Create a task that finishes immediately.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make each run take `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Shared run counter, readable after the task was registered.
    pub fn counter(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.count)
    }

    /// Number of completed runs.
    pub fn count(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Task for CountingTask {
    async fn run(&self) -> Result<(), TaskError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A task that fails a set number of times, then succeeds.
///
/// ```
/// use dbcron::testing::FailingTask;
///
/// // Fails 2 times, then succeeds on the 3rd run
/// let task = FailingTask::new(2);
/// ```
#[derive(Clone)]
pub struct FailingTask {
    failures_remaining: Arc<AtomicU32>,
    calls: Arc<AtomicU32>,
    error_message: String,
}

impl FailingTask {
    /// Create a task that fails `fail_count` times then succeeds.
    pub fn new(fail_count: u32) -> Self {
        Self::with_error(fail_count, "intentional test failure")
    }

    /// Create a task that always fails.
    pub fn always() -> Self {
        Self::new(u32::MAX)
    }

    /// Create a task that fails with a custom error message.
    pub fn with_error(fail_count: u32, message: impl Into<String>) -> Self {
        Self {
            failures_remaining: Arc::new(AtomicU32::new(fail_count)),
            calls: Arc::new(AtomicU32::new(0)),
            error_message: message.into(),
        }
    }

    /// Shared call counter, readable after the task was registered.
    pub fn calls(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl Task for FailingTask {
    async fn run(&self) -> Result<(), TaskError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        // Atomic check-and-decrement under concurrent runs.
        let failed = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        if failed {
            Err(TaskError::ExecutionFailed(self.error_message.clone()))
        } else {
            Ok(())
        }
    }
}

/// Poll `condition` every 10ms until it holds or `timeout` expires.
///
/// Returns whether the condition held.
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    loop {
        if condition().await {
            return true;
        }
        if start.elapsed() > timeout {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Drives one scheduler tick by tick against in-memory storage.
///
/// Each harness plays one host; [`TestHarness::another_host`] creates a
/// second host sharing the same storage.
///
/// ```
/// use dbcron::testing::{CountingTask, TestHarness};
/// use chrono::{TimeZone, Utc};
///
/// # tokio_test_block_on(async {
/// let mut harness = TestHarness::new();
/// harness.register("report", "* * * * *", CountingTask::new()).unwrap();
///
/// let top_of_minute = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap();
/// harness.bootstrap_at(top_of_minute).await.unwrap();
/// let report = harness.tick_at(top_of_minute).await.unwrap();
/// assert_eq!(report.ran_count(), 1);
/// # });
/// # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Runtime::new().unwrap().block_on(f)
/// # }
/// ```
pub struct TestHarness {
    storage: Arc<InMemoryStorage>,
    scheduler: Scheduler<InMemoryStorage>,
    config: SchedulerConfig,
}

impl TestHarness {
    /// Create a harness with the default configuration.
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    /// Create a harness with a custom configuration.
    pub fn with_config(config: SchedulerConfig) -> Self {
        Self::on_storage(Arc::new(InMemoryStorage::new()), config)
    }

    fn on_storage(storage: Arc<InMemoryStorage>, config: SchedulerConfig) -> Self {
        let mut scheduler = Scheduler::with_storage(Arc::clone(&storage));
        scheduler.configure(config.clone());
        Self {
            storage,
            scheduler,
            config,
        }
    }

    /// A second host with the same configuration, sharing this storage.
    ///
    /// Tasks are not copied; register them on the new host too.
    pub fn another_host(&self) -> Self {
        Self::on_storage(Arc::clone(&self.storage), self.config.clone())
    }

    /// Register a task.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        cron: &str,
        task: impl Task + 'static,
    ) -> Result<(), SchedulerError> {
        self.scheduler.register(name, cron, task)
    }

    /// Pin the clock to `time` and run the startup sequence.
    pub async fn bootstrap_at(&mut self, time: DateTime<Utc>) -> Result<(), SchedulerError> {
        self.storage.set_time(time)?;
        self.scheduler.bootstrap().await
    }

    /// Pin the clock to `time` and run one tick.
    pub async fn tick_at(&mut self, time: DateTime<Utc>) -> Result<TickReport, SchedulerError> {
        self.storage.set_time(time)?;
        self.scheduler.tick(time).await
    }

    /// The `last` column of a task's entry row.
    pub async fn last_run(&self, task: &str) -> Result<Option<DateTime<Utc>>, SchedulerError> {
        let rows = self.storage.list_entries(&[task.to_string()]).await?;
        Ok(rows.into_iter().next().and_then(|row| row.last))
    }

    /// The shared storage.
    pub fn storage(&self) -> &Arc<InMemoryStorage> {
        &self.storage
    }

    /// The scheduler under test.
    pub fn scheduler(&self) -> &Scheduler<InMemoryStorage> {
        &self.scheduler
    }

    /// Mutable access to the scheduler under test.
    pub fn scheduler_mut(&mut self) -> &mut Scheduler<InMemoryStorage> {
        &mut self.scheduler
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
