//! PostgreSQL storage implementation.
//!
//! The fleet deployment backend. Entry locks are real row locks taken with
//! `SELECT ... FOR UPDATE` inside a transaction, always in task-name order so
//! two hosts locking overlapping batches cannot deadlock each other.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};

use super::{EntryLock, Storage, StorageError, StoredEntry, StoredHost, TimeSource};
use crate::core::types::HostId;

/// Advisory lock key serializing concurrent schema migrations.
const MIGRATION_LOCK_KEY: i64 = 0x6462_6372_6f6e; // "dbcron"

/// PostgreSQL storage backend.
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    /// Connect to `url` and run migrations.
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        Self::from_pool(pool).await
    }

    /// Wrap an existing pool and run migrations.
    pub async fn from_pool(pool: PgPool) -> Result<Self, StorageError> {
        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Run database migrations.
    ///
    /// Hosts starting together serialize on an advisory lock.
    async fn run_migrations(&self) -> Result<(), StorageError> {
        let schema = include_str!("../../migrations/postgres/001_initial_schema.sql");
        let mut tx = self.pool.begin().await.map_err(map_error)?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::Other(format!("migration failed: {}", e)))?;
        sqlx::raw_sql(schema)
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::Other(format!("migration failed: {}", e)))?;

        tx.commit().await.map_err(map_error)
    }

    /// Close the database connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

type HostRow = (String, String, i64, DateTime<Utc>, DateTime<Utc>);

fn row_to_host(row: HostRow) -> Result<StoredHost, StorageError> {
    let (uuid, hostname, pid, started, last_seen) = row;
    Ok(StoredHost {
        id: uuid
            .parse::<HostId>()
            .map_err(|e| StorageError::SerializationError(format!("host uuid: {}", e)))?,
        hostname,
        pid: u32::try_from(pid)
            .map_err(|e| StorageError::SerializationError(format!("host pid: {}", e)))?,
        started,
        last_seen,
    })
}

/// Map a driver error, separating lock contention from everything else.
fn map_error(e: sqlx::Error) -> StorageError {
    if let sqlx::Error::Database(ref db) = e
        && let Some(code) = db.code()
        // serialization_failure, deadlock_detected, lock_not_available
        && matches!(code.as_ref(), "40001" | "40P01" | "55P03")
    {
        return StorageError::Conflict(db.message().to_string());
    }
    StorageError::Other(e.to_string())
}

#[async_trait]
impl TimeSource for PostgresStorage {
    async fn now(&self) -> Result<DateTime<Utc>, StorageError> {
        sqlx::query_scalar("SELECT CURRENT_TIMESTAMP")
            .fetch_one(&self.pool)
            .await
            .map_err(map_error)
    }
}

#[async_trait]
impl Storage for PostgresStorage {
    async fn create_entry(&self, task: &str) -> Result<bool, StorageError> {
        let existing: Option<i64> =
            sqlx::query_scalar("SELECT id FROM dbcron_entries WHERE task = $1")
                .bind(task)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_error)?;
        if existing.is_some() {
            return Ok(false);
        }

        let result = sqlx::query("INSERT INTO dbcron_entries (task, last) VALUES ($1, NULL)")
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
        let rows: Vec<(String, Option<DateTime<Utc>>)> = sqlx::query_as(
            "SELECT task, last FROM dbcron_entries WHERE task = ANY($1) ORDER BY task",
        )
        .bind(tasks)
        .fetch_all(&self.pool)
        .await
        .map_err(map_error)?;

        Ok(rows
            .into_iter()
            .map(|(task, last)| StoredEntry { task, last })
            .collect())
    }

    async fn lock_entries(&self, tasks: &[String]) -> Result<Box<dyn EntryLock>, StorageError> {
        let mut tx = self.pool.begin().await.map_err(map_error)?;

        let rows: Vec<(String, Option<DateTime<Utc>>)> = sqlx::query_as(
            r#"
            SELECT task, last
            FROM dbcron_entries
            WHERE task = ANY($1)
            ORDER BY task
            FOR UPDATE
            "#,
        )
        .bind(tasks)
        .fetch_all(&mut *tx)
        .await
        .map_err(map_error)?;

        let rows = rows
            .into_iter()
            .map(|(task, last)| StoredEntry { task, last })
            .collect();

        Ok(Box::new(PgEntryLock { tx: Some(tx), rows }))
    }

    async fn upsert_host(&self, host: StoredHost) -> Result<StoredHost, StorageError> {
        sqlx::query(
            r#"
            INSERT INTO dbcron_hosts (uuid, hostname, pid, started, last_seen)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (uuid) DO NOTHING
            "#,
        )
        .bind(host.id.to_string())
        .bind(&host.hostname)
        .bind(i64::from(host.pid))
        .bind(host.started)
        .bind(host.last_seen)
        .execute(&self.pool)
        .await
        .map_err(map_error)?;

        let row: HostRow = sqlx::query_as(
            "SELECT uuid, hostname, pid, started, last_seen FROM dbcron_hosts WHERE uuid = $1",
        )
        .bind(host.id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_error)?
        .ok_or_else(|| StorageError::NotFound(format!("host: {}", host.id)))?;

        row_to_host(row)
    }

    async fn touch_host(&self, id: &HostId, last_seen: DateTime<Utc>) -> Result<(), StorageError> {
        let result = sqlx::query("UPDATE dbcron_hosts SET last_seen = $1 WHERE uuid = $2")
            .bind(last_seen)
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

/// Row locks held by an open PostgreSQL transaction.
struct PgEntryLock {
    tx: Option<Transaction<'static, Postgres>>,
    rows: Vec<StoredEntry>,
}

#[async_trait]
impl EntryLock for PgEntryLock {
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

        // GREATEST ignores NULL, and keeps `last` from moving backwards.
        let result = sqlx::query(
            "UPDATE dbcron_entries SET last = GREATEST(last, CURRENT_TIMESTAMP) WHERE task = ANY($1)",
        )
        .bind(tasks)
        .execute(&mut **tx)
        .await
        .map_err(map_error)?;

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
