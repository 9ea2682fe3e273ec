//! Task trait and error types.
//!
//! A `Task` is the body the scheduler hands to the worker pool when a
//! crontab entry comes due. Implement the trait directly, or wrap a closure
//! with [`from_fn`] / [`from_blocking_fn`].

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur during task execution.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Task execution failed with a message.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    /// Task timed out.
    #[error("task timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// External command failed with exit code and stderr output.
    #[error("command exited with code {code}: {stderr}")]
    CommandFailed { code: i32, stderr: String },

    /// The task body panicked.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// Generic error wrapper.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// The body of a scheduled task.
///
/// Bodies are opaque to the scheduler: they may block, fail or run for a
/// long time. Errors are logged by the worker pool and never reach the
/// tick loop.
///
/// # Example
///
/// ```ignore
/// use dbcron::{Task, TaskError};
/// use async_trait::async_trait;
///
/// struct Vacuum;
///
/// #[async_trait]
/// impl Task for Vacuum {
///     async fn run(&self) -> Result<(), TaskError> {
///         // Do work
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Task: Send + Sync {
    /// Execute the task body.
    async fn run(&self) -> Result<(), TaskError>;

    /// Optional description for display/logging purposes.
    fn description(&self) -> Option<&str> {
        None
    }
}

/// A task backed by an async closure.
pub struct FnTask<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Task for FnTask<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
{
    async fn run(&self) -> Result<(), TaskError> {
        (self.f)().await
    }
}

/// Wrap an async closure as a [`Task`].
pub fn from_fn<F, Fut>(f: F) -> FnTask<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
{
    FnTask { f }
}

/// A task backed by a blocking closure, run on tokio's blocking pool.
pub struct BlockingFnTask<F> {
    f: Arc<F>,
}

#[async_trait]
impl<F> Task for BlockingFnTask<F>
where
    F: Fn() -> Result<(), TaskError> + Send + Sync + 'static,
{
    async fn run(&self) -> Result<(), TaskError> {
        let f = Arc::clone(&self.f);
        tokio::task::spawn_blocking(move || f())
            .await
            .map_err(|e| TaskError::Panicked(e.to_string()))?
    }
}

/// Wrap a blocking closure as a [`Task`].
pub fn from_blocking_fn<F>(f: F) -> BlockingFnTask<F>
where
    F: Fn() -> Result<(), TaskError> + Send + Sync + 'static,
{
    BlockingFnTask { f: Arc::new(f) }
}
