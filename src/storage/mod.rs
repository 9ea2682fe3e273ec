//! Storage abstraction for the shared scheduler state.
//!
//! Every host in the fleet talks to the same database. Two tables matter:
//! entry rows (one per task name, holding the last dispatch time) and host
//! rows (one per process, for liveness monitoring). The database clock is
//! the fleet's clock.
//!
//! Backends: in-memory (single process, tests), SQLite and PostgreSQL.

mod memory;
#[cfg(feature = "postgres")]
mod postgres;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::InMemoryStorage;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStorage;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;

use crate::core::types::HostId;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested item was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A duplicate key was detected.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// Storage lock was poisoned.
    #[error("storage lock poisoned")]
    LockPoisoned,

    /// The transaction lost a race (busy, deadlock, serialization failure).
    #[error("transaction conflict: {0}")]
    Conflict(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Generic storage error.
    #[error("storage error: {0}")]
    Other(String),
}

impl StorageError {
    /// Whether retrying on a later tick can succeed.
    ///
    /// Contention is retryable; connectivity and data errors are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Conflict(_))
    }
}

/// Stored entry row: the shared dispatch record of one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    /// Task name (unique).
    pub task: String,
    /// When the task was last dispatched by any host.
    pub last: Option<DateTime<Utc>>,
}

/// Stored host row: liveness record of one scheduler process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredHost {
    /// Process-generated identifier.
    pub id: HostId,
    /// Machine hostname.
    pub hostname: String,
    /// Operating system process id.
    pub pid: u32,
    /// When the process started scheduling.
    pub started: DateTime<Utc>,
    /// Last heartbeat.
    pub last_seen: DateTime<Utc>,
}

impl StoredHost {
    /// Describe the current process, started at `started`.
    pub fn new(id: HostId, started: DateTime<Utc>) -> Self {
        let hostname = hostname::get()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());

        Self {
            id,
            hostname,
            pid: std::process::id(),
            started,
            last_seen: started,
        }
    }

    /// Whether the host has sent a heartbeat within `threshold` of `now`.
    pub fn is_alive(&self, now: DateTime<Utc>, threshold: TimeDelta) -> bool {
        now - self.last_seen <= threshold
    }
}

/// Source of the fleet-wide current time.
#[async_trait]
pub trait TimeSource: Send + Sync {
    /// Current time according to the shared database, in UTC.
    async fn now(&self) -> Result<DateTime<Utc>, StorageError>;
}

/// Row locks held on a batch of entry rows.
///
/// Backed by an open transaction (or its in-memory equivalent). Dropping
/// the lock without calling [`EntryLock::commit`] rolls back every pending
/// update and releases the locks.
#[async_trait]
pub trait EntryLock: Send {
    /// The locked rows, as read after the locks were acquired.
    fn entries(&self) -> &[StoredEntry];

    /// Set `last` to the current database time for `tasks`.
    ///
    /// Only rows covered by this lock may be updated. Returns the number of
    /// rows affected.
    async fn mark_run(&mut self, tasks: &[String]) -> Result<u64, StorageError>;

    /// Commit pending updates and release the locks.
    async fn commit(&mut self) -> Result<(), StorageError>;
}

/// Storage trait for the shared scheduler state.
#[async_trait]
pub trait Storage: TimeSource {
    // Entry operations

    /// Ensure an entry row exists for `task`.
    ///
    /// Returns `Ok(true)` if a row was created and `Ok(false)` if it was
    /// already there. A concurrent creator winning the race surfaces as
    /// [`StorageError::DuplicateKey`].
    async fn create_entry(&self, task: &str) -> Result<bool, StorageError>;

    /// Read the entry rows for `tasks`. Missing rows are omitted.
    async fn list_entries(&self, tasks: &[String]) -> Result<Vec<StoredEntry>, StorageError>;

    /// Lock the entry rows for `tasks`, blocking while another holder has them.
    async fn lock_entries(&self, tasks: &[String]) -> Result<Box<dyn EntryLock>, StorageError>;

    // Host operations

    /// Find the host row with `host.id`, or insert `host` if there is none.
    async fn upsert_host(&self, host: StoredHost) -> Result<StoredHost, StorageError>;

    /// Record a heartbeat for a host.
    async fn touch_host(&self, id: &HostId, last_seen: DateTime<Utc>)
    -> Result<(), StorageError>;

    /// List all host rows, oldest first.
    async fn list_hosts(&self) -> Result<Vec<StoredHost>, StorageError>;
}
