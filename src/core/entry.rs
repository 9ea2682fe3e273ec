//! Crontab entries and the readiness policy.
//!
//! A [`CrontabEntry`] is the in-memory view of one registered task: its
//! schedule, its body and the last dispatch time mirrored from storage.
//! Cross-process agreement goes through the entry rows only; an entry is
//! owned and mutated by a single scheduler.

use chrono::{DateTime, TimeDelta, Timelike, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

use super::schedule::{Schedule, ScheduleError};
use super::task::Task;
use crate::execution::{TaskResult, WorkerPool};

/// How far ahead of its nominal fire time a task may be admitted.
pub const GRACE_TIME: Duration = Duration::from_secs(5 * 60);

/// Tick period. Ticks are aligned to multiples of this from the top of the minute.
pub const SLEEPY_TIME: Duration = Duration::from_secs(3);

/// Minimum age of a host row's `last_seen` before it is written again.
pub const HOST_ALIVE_TIME: Duration = Duration::from_secs(15);

/// Convert a std duration into a chrono delta.
pub(crate) fn delta(duration: Duration) -> TimeDelta {
    TimeDelta::milliseconds(duration.as_millis() as i64)
}

/// One registered task and its scheduling state.
pub struct CrontabEntry {
    name: String,
    schedule: Schedule,
    task: Arc<dyn Task>,
    last: Option<DateTime<Utc>>,
    interval: Option<TimeDelta>,
}

impl CrontabEntry {
    /// Create an entry that has never run.
    pub fn new(name: impl Into<String>, schedule: Schedule, task: Arc<dyn Task>) -> Self {
        Self {
            name: name.into(),
            schedule,
            task,
            last: None,
            interval: None,
        }
    }

    /// The task name (fleet-wide unique key).
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn task(&self) -> &Arc<dyn Task> {
        &self.task
    }

    /// Time of the most recent dispatch known to this process.
    pub fn last(&self) -> Option<DateTime<Utc>> {
        self.last
    }

    /// Import `last` from storage. Overwrites unconditionally.
    pub fn set_last(&mut self, last: Option<DateTime<Utc>>) {
        self.last = last;
    }

    /// Replace the schedule, e.g. after the timezone changed.
    ///
    /// Clears the cached interval.
    pub fn set_schedule(&mut self, schedule: Schedule) {
        self.schedule = schedule;
        self.interval = None;
    }

    /// Half the gap between two consecutive fire times around `now`.
    ///
    /// Computed on first use and cached for the lifetime of the schedule.
    pub fn interval(&mut self, now: DateTime<Utc>) -> Result<TimeDelta, ScheduleError> {
        if let Some(interval) = self.interval {
            return Ok(interval);
        }

        let next = self.schedule.next_after(now)?;
        let previous = self.schedule.previous_before(next)?;
        let interval = (next - previous) / 2;

        self.interval = Some(interval);
        Ok(interval)
    }

    /// Whether the task may be dispatched at `now`.
    ///
    /// All of the following must hold:
    /// 1. the next fire time is no later than `now + GRACE_TIME`;
    /// 2. if the task has run, at least `interval` has elapsed since;
    /// 3. if it has never run, `now` is within `2 * SLEEPY_TIME` of the
    ///    top of the minute.
    pub fn is_ready(&mut self, now: DateTime<Utc>) -> bool {
        let next = match self.schedule.next_after(now) {
            Ok(next) => next,
            Err(e) => {
                debug!(task = %self.name, error = %e, "No upcoming fire time");
                return false;
            }
        };

        if next > now + delta(GRACE_TIME) {
            return false;
        }

        match self.last {
            Some(last) => {
                let interval = match self.interval(now) {
                    Ok(interval) => interval,
                    Err(e) => {
                        debug!(task = %self.name, error = %e, "Cannot derive interval");
                        return false;
                    }
                };

                // Running too often.
                now - last >= interval
            }
            None => u64::from(now.second()) < 2 * SLEEPY_TIME.as_secs(),
        }
    }

    /// Record a dispatch at `now` and hand the body to the pool.
    ///
    /// Does not wait for the body and does not touch storage.
    pub fn run(&mut self, now: DateTime<Utc>, pool: &WorkerPool) -> JoinHandle<TaskResult> {
        self.last = Some(now);
        pool.dispatch(self.name.clone(), Arc::clone(&self.task))
    }
}

impl fmt::Debug for CrontabEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrontabEntry")
            .field("name", &self.name)
            .field("schedule", &self.schedule.expression())
            .field("last", &self.last)
            .field("interval", &self.interval)
            .finish()
    }
}
