//! dbcron - cron for a fleet of hosts sharing one database.
//!
//! Every host runs the same [`Scheduler`] with the same registered tasks.
//! Hosts agree on who runs what through row locks on a shared entries
//! table, so each task runs once per scheduled slot across the fleet.

pub mod config;
pub mod core;
pub mod execution;
pub mod scheduler;
pub mod storage;
pub mod testing;

pub use config::{
    ConfigBuilder, ConfigError, DbcronConfig, StorageConfig, TaskConfig, YamlLoader,
};
pub use core::entry::{CrontabEntry, GRACE_TIME, HOST_ALIVE_TIME, SLEEPY_TIME};
pub use core::schedule::{Schedule, ScheduleError};
pub use core::task::{BlockingFnTask, FnTask, Task, TaskError, from_blocking_fn, from_fn};
pub use core::types::HostId;
pub use execution::{CommandTask, CommandTaskBuilder, TaskResult, WorkerPool};
pub use scheduler::{
    BatchReport, Scheduler, SchedulerConfig, SchedulerError, SchedulerHandle, SchedulerState,
    TickReport, next_tick_delay,
};
#[cfg(feature = "postgres")]
pub use storage::PostgresStorage;
#[cfg(feature = "sqlite")]
pub use storage::SqliteStorage;
pub use storage::{
    EntryLock, InMemoryStorage, Storage, StorageError, StoredEntry, StoredHost, TimeSource,
};
