//! Bounded worker pool for task bodies.
//!
//! The `WorkerPool` runs task bodies off the scheduler loop with:
//! - Concurrency limiting via semaphore
//! - Failure isolation (errors and panics are logged, never propagated)
//! - Graceful drain on shutdown

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error};

use crate::core::task::{Task, TaskError};

/// Result of running a task body.
#[derive(Debug, Clone)]
pub struct TaskResult {
    /// Name of the task that was run.
    pub task: String,
    /// Whether the body succeeded.
    pub success: bool,
    /// Wall time spent in the body.
    pub duration: Duration,
    /// Error if the body failed.
    pub error: Option<String>,
}

impl TaskResult {
    /// Create a successful result.
    pub fn success(task: String, duration: Duration) -> Self {
        Self {
            task,
            success: true,
            duration,
            error: None,
        }
    }

    /// Create a failed result.
    pub fn failure(task: String, duration: Duration, error: String) -> Self {
        Self {
            task,
            success: false,
            duration,
            error: Some(error),
        }
    }
}

/// Fixed-size pool of concurrent task executors.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    /// Maximum number of concurrently running bodies.
    size: usize,
    /// Semaphore for concurrency control.
    semaphore: Arc<Semaphore>,
    /// Every dispatched body, including those still waiting for a worker.
    tracker: TaskTracker,
}

impl WorkerPool {
    /// Create a pool with `size` workers. A size of zero is clamped to one.
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            size,
            semaphore: Arc::new(Semaphore::new(size)),
            tracker: TaskTracker::new(),
        }
    }

    /// Get the pool capacity.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Get the number of idle workers.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Run a task body on the pool.
    ///
    /// Returns immediately; the body waits for a free worker in the
    /// background. Failures are logged here and reported through the
    /// returned handle only.
    pub fn dispatch(&self, name: String, task: Arc<dyn Task>) -> JoinHandle<TaskResult> {
        let semaphore = Arc::clone(&self.semaphore);

        self.tracker.spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!(task = %name, error = %e, "failed: worker pool closed");
                    return TaskResult::failure(name, Duration::ZERO, e.to_string());
                }
            };

            let start = Instant::now();
            debug!(task = %name, "Task started");

            // Run the body in its own task so a panic is contained.
            let outcome = match tokio::spawn(async move { task.run().await }).await {
                Ok(result) => result,
                Err(join_error) => Err(TaskError::Panicked(join_error.to_string())),
            };

            let duration = start.elapsed();
            match outcome {
                Ok(()) => {
                    debug!(task = %name, duration_ms = duration.as_millis() as u64, "Task finished");
                    TaskResult::success(name, duration)
                }
                Err(e) => {
                    error!(task = %name, error = %e, "failed: {}", e);
                    TaskResult::failure(name, duration, e.to_string())
                }
            }
        })
    }

    /// Wait until every dispatched body has finished, up to `timeout`.
    ///
    /// Returns `true` if the pool drained in time. The pool accepts new
    /// dispatches again afterwards.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.tracker.close();
        let drained = tokio::time::timeout(timeout, self.tracker.wait())
            .await
            .is_ok();
        self.tracker.reopen();
        drained
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(4) // Default to 4 concurrent tasks
    }
}
