//! Scheduler handle for controlling a running scheduler.
//!
//! This module provides the `SchedulerHandle` type that lets other tasks
//! observe the scheduler's state and ask it to stop.

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::types::SchedulerState;

/// Handle for controlling the scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    pub(crate) stop: CancellationToken,
    pub(crate) state: watch::Receiver<SchedulerState>,
}

impl SchedulerHandle {
    /// Ask the tick loop to exit.
    ///
    /// Cooperative: an in-flight tick finishes first, and the loop exits
    /// instead of sleeping until the next one.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Whether stop has been requested.
    pub fn is_stopping(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Get the current scheduler state.
    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    /// Check if the scheduler is running.
    pub fn is_running(&self) -> bool {
        self.state() == SchedulerState::Running
    }

    /// Wait until the scheduler reaches `state`.
    ///
    /// Returns `false` if the scheduler was dropped first.
    pub async fn wait_for(&self, state: SchedulerState) -> bool {
        let mut rx = self.state.clone();
        rx.wait_for(|current| *current == state).await.is_ok()
    }
}
