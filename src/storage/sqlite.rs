//! SQLite storage implementation.
//!
//! Provides persistent storage using a SQLite database shared by every
//! scheduler process on the machine. SQLite has no row locks: locking a
//! batch touches its rows first, which takes the database write lock for the
//! rest of the transaction. Contending writers wait up to the busy timeout.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, Transaction};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use super::{EntryLock, Storage, StorageError, StoredEntry, StoredHost, TimeSource};
use crate::core::types::HostId;

/// Current time as stored text, evaluated by SQLite.
const NOW_SQL: &str = "strftime('%Y-%m-%dT%H:%M:%fZ', 'now')";

/// How long a writer waits for the database write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite storage backend.
///
/// Provides persistent storage with automatic schema migration.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Create a new SQLite storage with the given database path.
    ///
    /// Creates the database file if it doesn't exist and runs migrations.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path_str = path.as_ref().to_string_lossy();
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path_str))
            .map_err(|e| StorageError::Other(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Create an in-memory SQLite database (useful for testing).
    ///
    /// Backed by a single connection, so a held entry lock also delays
    /// every other query on this storage until it is released.
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Run database migrations.
    async fn run_migrations(&self) -> Result<(), StorageError> {
        let schema = include_str!("../../migrations/sqlite/001_initial_schema.sql");
        sqlx::raw_sql(schema)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Other(format!("migration failed: {}", e)))?;
        Ok(())
    }

    /// Close the database connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

// Helper functions for time conversion
fn time_to_string(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn string_to_time(s: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StorageError::SerializationError(format!("bad timestamp {:?}: {}", s, e)))
}

fn row_to_entry((task, last): (String, Option<String>)) -> Result<StoredEntry, StorageError> {
    Ok(StoredEntry {
        task,
        last: last.as_deref().map(string_to_time).transpose()?,
    })
}

type HostRow = (String, String, i64, String, String);

fn row_to_host(row: HostRow) -> Result<StoredHost, StorageError> {
    let (uuid, hostname, pid, started, last_seen) = row;
    Ok(StoredHost {
        id: uuid
            .parse::<HostId>()
            .map_err(|e| StorageError::SerializationError(format!("host uuid: {}", e)))?,
        hostname,
        pid: u32::try_from(pid)
            .map_err(|e| StorageError::SerializationError(format!("host pid: {}", e)))?,
        started: string_to_time(&started)?,
        last_seen: string_to_time(&last_seen)?,
    })
}

/// Map a driver error, separating lock contention from everything else.
fn map_error(e: sqlx::Error) -> StorageError {
    if let sqlx::Error::Database(ref db) = e
        && let Some(code) = db.code()
        && let Ok(code) = code.parse::<i32>()
    {
        // Primary result codes live in the low byte: SQLITE_BUSY, SQLITE_LOCKED.
        if matches!(code & 0xff, 5 | 6) {
            return StorageError::Conflict(db.message().to_string());
        }
    }
    StorageError::Other(e.to_string())
}

/// Append `(?, ?, ...)` binding every task name.
fn push_task_list(builder: &mut QueryBuilder<'_, Sqlite>, tasks: &[String]) {
    builder.push("(");
    let mut separated = builder.separated(", ");
    for task in tasks {
        separated.push_bind(task.clone());
    }
    separated.push_unseparated(")");
}

#[async_trait]
impl TimeSource for SqliteStorage {
    async fn now(&self) -> Result<DateTime<Utc>, StorageError> {
        let now: String = sqlx::query_scalar(&format!("SELECT {}", NOW_SQL))
            .fetch_one(&self.pool)
            .await
            .map_err(map_error)?;
        string_to_time(&now)
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn create_entry(&self, task: &str) -> Result<bool, StorageError> {
        let existing: Option<i64> =
            sqlx::query_scalar("SELECT id FROM dbcron_entries WHERE task = ?")
                .bind(task)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_error)?;
        if existing.is_some() {
            return Ok(false);
        }

        let result = sqlx::query("INSERT INTO dbcron_entries (task, last) VALUES (?, NULL)")
            .bind(task)
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StorageError::DuplicateKey(format!("entry: {}", task)))
            }
            Err(e) => Err(map_error(e)),
        }
    }

    async fn list_entries(&self, tasks: &[String]) -> Result<Vec<StoredEntry>, StorageError> {
        if tasks.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder = QueryBuilder::new("SELECT task, last FROM dbcron_entries WHERE task IN ");
        push_task_list(&mut builder, tasks);
        builder.push(" ORDER BY task");

        let rows: Vec<(String, Option<String>)> = builder
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(map_error)?;

        rows.into_iter().map(row_to_entry).collect()
    }

    async fn lock_entries(&self, tasks: &[String]) -> Result<Box<dyn EntryLock>, StorageError> {
        let mut tx = self.pool.begin().await.map_err(map_error)?;

        if tasks.is_empty() {
            return Ok(Box::new(SqliteEntryLock {
                tx: Some(tx),
                rows: Vec::new(),
            }));
        }

        // Writing first takes the database write lock before anything is read.
        let mut touch = QueryBuilder::new("UPDATE dbcron_entries SET last = last WHERE task IN ");
        push_task_list(&mut touch, tasks);
        touch.build().execute(&mut *tx).await.map_err(map_error)?;

        let mut select = QueryBuilder::new("SELECT task, last FROM dbcron_entries WHERE task IN ");
        push_task_list(&mut select, tasks);
        select.push(" ORDER BY task");

        let rows: Vec<(String, Option<String>)> = select
            .build_query_as()
            .fetch_all(&mut *tx)
            .await
            .map_err(map_error)?;
        let rows = rows
            .into_iter()
            .map(row_to_entry)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Box::new(SqliteEntryLock { tx: Some(tx), rows }))
    }

    async fn upsert_host(&self, host: StoredHost) -> Result<StoredHost, StorageError> {
        sqlx::query(
            r#"
            INSERT INTO dbcron_hosts (uuid, hostname, pid, started, last_seen)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(uuid) DO NOTHING
            "#,
        )
        .bind(host.id.to_string())
        .bind(&host.hostname)
        .bind(i64::from(host.pid))
        .bind(time_to_string(host.started))
        .bind(time_to_string(host.last_seen))
        .execute(&self.pool)
        .await
        .map_err(map_error)?;

        let row: HostRow = sqlx::query_as(
            "SELECT uuid, hostname, pid, started, last_seen FROM dbcron_hosts WHERE uuid = ?",
        )
        .bind(host.id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_error)?
        .ok_or_else(|| StorageError::NotFound(format!("host: {}", host.id)))?;

        row_to_host(row)
    }

    async fn touch_host(&self, id: &HostId, last_seen: DateTime<Utc>) -> Result<(), StorageError> {
        let result = sqlx::query("UPDATE dbcron_hosts SET last_seen = ? WHERE uuid = ?")
            .bind(time_to_string(last_seen))
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(map_error)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("host: {}", id)));
        }
        Ok(())
    }

    async fn list_hosts(&self) -> Result<Vec<StoredHost>, StorageError> {
        let rows: Vec<HostRow> = sqlx::query_as(
            "SELECT uuid, hostname, pid, started, last_seen FROM dbcron_hosts ORDER BY started, id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_error)?;

        rows.into_iter().map(row_to_host).collect()
    }
}

/// An open write transaction over a batch of entry rows.
struct SqliteEntryLock {
    tx: Option<Transaction<'static, Sqlite>>,
    rows: Vec<StoredEntry>,
}

#[async_trait]
impl EntryLock for SqliteEntryLock {
    fn entries(&self) -> &[StoredEntry] {
        &self.rows
    }

    async fn mark_run(&mut self, tasks: &[String]) -> Result<u64, StorageError> {
        if let Some(task) = tasks
            .iter()
            .find(|task| !self.rows.iter().any(|row| &row.task == *task))
        {
            return Err(StorageError::NotFound(format!("locked entry: {}", task)));
        }

        let tx = self
            .tx
            .as_mut()
            .ok_or_else(|| StorageError::Other("lock already committed".into()))?;

        if tasks.is_empty() {
            return Ok(0);
        }

        // max() keeps `last` from moving backwards.
        let mut update = QueryBuilder::new(format!(
            "UPDATE dbcron_entries SET last = max(coalesce(last, ''), {}) WHERE task IN ",
            NOW_SQL
        ));
        push_task_list(&mut update, tasks);

        let result = update.build().execute(&mut **tx).await.map_err(map_error)?;
        Ok(result.rows_affected())
    }

    async fn commit(&mut self) -> Result<(), StorageError> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| StorageError::Other("lock already committed".into()))?;
        tx.commit().await.map_err(map_error)
    }
}
