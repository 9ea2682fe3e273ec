//! Scheduler engine implementation.
//!
//! One scheduler runs per process. Every [`SLEEPY_TIME`] it reads the shared
//! database clock, collects the entries that look due and dispatches them in
//! batches no larger than the worker pool. Each batch is decided under row
//! locks on its entry rows, with `last` re-read under the lock, so across
//! the fleet at most one host dispatches a task for a given slot.

use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::handle::SchedulerHandle;
use super::types::{BatchReport, SchedulerConfig, SchedulerError, SchedulerState, TickReport};
use crate::core::entry::{CrontabEntry, HOST_ALIVE_TIME, SLEEPY_TIME, delta};
use crate::core::schedule::Schedule;
use crate::core::task::Task;
use crate::core::types::HostId;
use crate::execution::WorkerPool;
use crate::storage::{Storage, StorageError, StoredEntry, StoredHost};

/// Time to sleep after a tick finishing at `finish`, so the next tick lands
/// on a multiple of [`SLEEPY_TIME`] counted from the top of the minute.
pub fn next_tick_delay(finish: DateTime<Utc>) -> Duration {
    let period = SLEEPY_TIME.as_secs() as u32;
    let into_period = Duration::new(
        u64::from(finish.second() % period),
        finish.nanosecond() % 1_000_000_000,
    );
    SLEEPY_TIME.saturating_sub(into_period)
}

/// The per-process scheduler (the "clock" of a dbcron host).
pub struct Scheduler<S: Storage> {
    /// Shared state across the fleet.
    storage: Arc<S>,
    pool: WorkerPool,
    /// Registered tasks in registration order.
    entries: Vec<CrontabEntry>,
    /// Task name to position in `entries`.
    index: HashMap<String, usize>,
    timezone: Tz,
    host_id: HostId,
    /// Last heartbeat written to this host's row.
    host_last_seen: Option<DateTime<Utc>>,
    shutdown_timeout: Duration,
    state: watch::Sender<SchedulerState>,
    stop: CancellationToken,
}

impl<S: Storage + 'static> Scheduler<S> {
    /// Create a new scheduler with the given storage.
    pub fn new(storage: S) -> Self {
        Self::with_storage(Arc::new(storage))
    }

    /// Create a new scheduler with shared storage.
    ///
    /// Schedulers sharing one storage behave like separate hosts.
    pub fn with_storage(storage: Arc<S>) -> Self {
        let defaults = SchedulerConfig::default();
        let (state, _) = watch::channel(SchedulerState::Created);

        Self {
            storage,
            pool: WorkerPool::new(defaults.pool_size),
            entries: Vec::new(),
            index: HashMap::new(),
            timezone: defaults.timezone,
            host_id: HostId::new(),
            host_last_seen: None,
            shutdown_timeout: defaults.shutdown_timeout,
            state,
            stop: CancellationToken::new(),
        }
    }

    /// Apply settings. Required once before [`Scheduler::start`].
    ///
    /// Tasks registered earlier are re-bound to the new timezone.
    pub fn configure(&mut self, config: SchedulerConfig) {
        self.timezone = config.timezone;
        for entry in &mut self.entries {
            let schedule = entry.schedule().rezoned(config.timezone);
            entry.set_schedule(schedule);
        }
        self.pool = WorkerPool::new(config.pool_size);
        self.shutdown_timeout = config.shutdown_timeout;

        self.state.send_if_modified(|state| {
            let promote = *state == SchedulerState::Created;
            if promote {
                *state = SchedulerState::Configured;
            }
            promote
        });
    }

    /// Register a task under a fleet-wide unique name.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        cron: &str,
        task: impl Task + 'static,
    ) -> Result<(), SchedulerError> {
        let name = name.into();
        if self.index.contains_key(&name) {
            return Err(SchedulerError::DuplicateTask(name));
        }

        let schedule = Schedule::in_timezone(cron, self.timezone)?;
        self.index.insert(name.clone(), self.entries.len());
        self.entries
            .push(CrontabEntry::new(name, schedule, Arc::new(task)));
        Ok(())
    }

    pub fn host_id(&self) -> HostId {
        self.host_id
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    /// Registered entries, in registration order.
    pub fn entries(&self) -> &[CrontabEntry] {
        &self.entries
    }

    /// Look up an entry by task name.
    pub fn entry(&self, name: &str) -> Option<&CrontabEntry> {
        self.index.get(name).map(|&i| &self.entries[i])
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Get a handle for stopping and observing this scheduler.
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            stop: self.stop.clone(),
            state: self.state.subscribe(),
        }
    }

    /// Startup sequence: register the host, ensure entry rows exist and
    /// import their `last` values.
    pub async fn bootstrap(&mut self) -> Result<(), SchedulerError> {
        let now = self.storage.now().await?;
        let host = self
            .storage
            .upsert_host(StoredHost::new(self.host_id, now))
            .await?;
        self.host_last_seen = Some(host.last_seen);

        for entry in &self.entries {
            match self.storage.create_entry(entry.name()).await {
                Ok(true) => debug!(task = %entry.name(), "Created entry row"),
                Ok(false) => {}
                // Another host created it between our check and insert.
                Err(StorageError::DuplicateKey(_)) => {
                    debug!(task = %entry.name(), "Entry row created concurrently")
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.refresh().await?;

        info!(
            workers = self.pool.size(),
            host = %self.host_id,
            "dbcron starting with {} workers",
            self.pool.size()
        );
        Ok(())
    }

    /// Re-import `last` for every registered task.
    async fn refresh(&mut self) -> Result<(), SchedulerError> {
        if self.entries.is_empty() {
            return Ok(());
        }
        let names: Vec<String> = self.entries.iter().map(|e| e.name().to_string()).collect();
        let rows = self.storage.list_entries(&names).await?;
        self.import(&rows);
        Ok(())
    }

    fn import(&mut self, rows: &[StoredEntry]) {
        for row in rows {
            if let Some(&i) = self.index.get(&row.task) {
                self.entries[i].set_last(row.last);
            }
        }
    }

    /// Write this host's liveness row if it is older than [`HOST_ALIVE_TIME`].
    ///
    /// Returns whether the row was written.
    pub async fn heartbeat(&mut self, now: DateTime<Utc>) -> Result<bool, SchedulerError> {
        match self.host_last_seen {
            Some(seen) if now - seen <= delta(HOST_ALIVE_TIME) => return Ok(false),
            Some(_) => self.storage.touch_host(&self.host_id, now).await?,
            None => {
                self.storage
                    .upsert_host(StoredHost::new(self.host_id, now))
                    .await?;
            }
        }

        debug!(host = %self.host_id, "Heartbeat");
        self.host_last_seen = Some(now);
        Ok(true)
    }

    /// Run one scheduling pass at shared time `now`.
    ///
    /// Ready tasks are shuffled and split into batches of the pool size;
    /// batches are processed one after another. Returns once every batch
    /// has been dispatched, without waiting for task bodies.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Result<TickReport, SchedulerError> {
        let mut ready: Vec<usize> = self
            .entries
            .iter_mut()
            .enumerate()
            .filter_map(|(i, entry)| entry.is_ready(now).then_some(i))
            .collect();
        ready.shuffle(&mut rand::thread_rng());

        let mut report = TickReport::default();
        for batch in ready.chunks(self.pool.size()) {
            report.batches.push(self.run_batch(batch, now).await?);
        }
        Ok(report)
    }

    async fn run_batch(
        &mut self,
        batch: &[usize],
        now: DateTime<Utc>,
    ) -> Result<BatchReport, SchedulerError> {
        let mut report = BatchReport {
            tasks: batch
                .iter()
                .map(|&i| self.entries[i].name().to_string())
                .collect(),
            ..Default::default()
        };

        match self.locked_batch(&mut report, now).await {
            Ok(()) => Ok(report),
            Err(e) if e.is_retryable() => {
                warn!(
                    tasks = ?report.tasks,
                    error = %e,
                    "Batch transaction failed, tasks stay eligible for the next tick"
                );
                report.abandoned = true;
                Ok(report)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Decide and dispatch one batch while holding its row locks.
    async fn locked_batch(
        &mut self,
        report: &mut BatchReport,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut lock = self.storage.lock_entries(&report.tasks).await?;

        info!(tasks = ?report.tasks, "running {}", report.tasks.join(", "));

        // Another host may have dispatched since the readiness scan.
        let mut missing = Vec::new();
        for name in &report.tasks {
            match lock.entries().iter().find(|row| &row.task == name) {
                Some(row) => {
                    if let Some(&i) = self.index.get(name) {
                        self.entries[i].set_last(row.last);
                    }
                }
                None => missing.push(name.clone()),
            }
        }

        for name in &report.tasks {
            let Some(&i) = self.index.get(name) else {
                continue;
            };
            if !missing.contains(name) && self.entries[i].is_ready(now) {
                // Fire and forget.
                drop(self.entries[i].run(now, &self.pool));
                report.ran.push(name.clone());
            } else {
                report.skipped.push(name.clone());
            }
        }

        if !report.skipped.is_empty() {
            info!(
                tasks = ?report.skipped,
                "did not run {}",
                report.skipped.join(", ")
            );
        }

        if !report.ran.is_empty() {
            lock.mark_run(&report.ran).await?;
        }
        lock.commit().await?;

        for name in &missing {
            warn!(task = %name, "Entry row missing, recreating it");
            match self.storage.create_entry(name).await {
                Ok(_) | Err(StorageError::DuplicateKey(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Run the scheduler until stopped. Blocks the calling task.
    ///
    /// Storage failures other than lock contention end the loop with an
    /// error. Either way the pool is drained before returning.
    pub async fn start(&mut self) -> Result<(), SchedulerError> {
        let state = self.state();
        match state {
            SchedulerState::Created => return Err(SchedulerError::NotConfigured),
            SchedulerState::Running | SchedulerState::Stopped => {
                return Err(SchedulerError::AlreadyStarted);
            }
            SchedulerState::Configured => {}
        }

        self.state.send_replace(SchedulerState::Running);
        let result = self.run_loop().await;
        self.state.send_replace(SchedulerState::Stopped);

        if let Err(e) = &result {
            error!(host = %self.host_id, error = %e, "Tick loop failed");
        }

        if !self.pool.drain(self.shutdown_timeout).await {
            warn!(
                "Graceful shutdown timeout ({:?}) exceeded with {} task(s) still running",
                self.shutdown_timeout,
                self.pool.size() - self.pool.available()
            );
        }

        info!(host = %self.host_id, "dbcron stopped");
        result
    }

    async fn run_loop(&mut self) -> Result<(), SchedulerError> {
        self.bootstrap().await?;

        loop {
            let start = self.storage.now().await?;
            self.heartbeat(start).await?;
            self.tick(start).await?;
            let finish = self.storage.now().await?;

            tokio::select! {
                _ = tokio::time::sleep(next_tick_delay(finish)) => {}
                _ = self.stop.cancelled() => {}
            }

            if self.stop.is_cancelled() {
                return Ok(());
            }
        }
    }

    /// Run [`Scheduler::start`] on a new tokio task.
    pub fn spawn(mut self) -> (SchedulerHandle, JoinHandle<Result<(), SchedulerError>>) {
        let handle = self.handle();
        let task = tokio::spawn(async move { self.start().await });
        (handle, task)
    }
}
