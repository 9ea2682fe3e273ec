//! In-memory storage implementation.
//!
//! Provides a thread-safe in-memory backend for tests and single-process
//! deployments. Several schedulers sharing one `Arc<InMemoryStorage>` behave
//! like hosts sharing a database: each entry row has its own async mutex
//! standing in for a row lock, and committed values are visible to plain
//! reads while a lock is held.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{EntryLock, Storage, StorageError, StoredEntry, StoredHost, TimeSource};
use crate::core::types::HostId;

struct EntryRow {
    lock: Arc<Mutex<()>>,
    last: Option<DateTime<Utc>>,
}

type EntryTable = Arc<RwLock<HashMap<String, EntryRow>>>;
type Clock = Arc<RwLock<Option<DateTime<Utc>>>>;

fn read_clock(clock: &Clock) -> Result<DateTime<Utc>, StorageError> {
    let pinned = clock.read().map_err(|_| StorageError::LockPoisoned)?;
    Ok(pinned.unwrap_or_else(Utc::now))
}

/// In-memory storage backend.
///
/// Data is not persisted across restarts. The clock follows the wall clock
/// unless pinned with [`InMemoryStorage::set_time`].
pub struct InMemoryStorage {
    entries: EntryTable,
    hosts: RwLock<HashMap<HostId, StoredHost>>,
    clock: Clock,
}

impl InMemoryStorage {
    /// Create a new empty in-memory storage.
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            hosts: RwLock::new(HashMap::new()),
            clock: Arc::new(RwLock::new(None)),
        }
    }

    /// Pin the storage clock to `time`.
    pub fn set_time(&self, time: DateTime<Utc>) -> Result<(), StorageError> {
        let mut clock = self.clock.write().map_err(|_| StorageError::LockPoisoned)?;
        *clock = Some(time);
        Ok(())
    }

    /// Move the storage clock forward, pinning it first if needed.
    pub fn advance(&self, by: TimeDelta) -> Result<DateTime<Utc>, StorageError> {
        let mut clock = self.clock.write().map_err(|_| StorageError::LockPoisoned)?;
        let next = clock.unwrap_or_else(Utc::now) + by;
        *clock = Some(next);
        Ok(next)
    }

    /// Delete an entry row. Returns whether it existed.
    pub fn remove_entry(&self, task: &str) -> Result<bool, StorageError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        Ok(entries.remove(task).is_some())
    }

    /// Number of entry rows.
    pub fn entry_count(&self) -> Result<usize, StorageError> {
        let entries = self
            .entries
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        Ok(entries.len())
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TimeSource for InMemoryStorage {
    async fn now(&self) -> Result<DateTime<Utc>, StorageError> {
        read_clock(&self.clock)
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn create_entry(&self, task: &str) -> Result<bool, StorageError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        if entries.contains_key(task) {
            return Ok(false);
        }
        entries.insert(
            task.to_string(),
            EntryRow {
                lock: Arc::new(Mutex::new(())),
                last: None,
            },
        );
        Ok(true)
    }

    async fn list_entries(&self, tasks: &[String]) -> Result<Vec<StoredEntry>, StorageError> {
        let entries = self
            .entries
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        let result = tasks
            .iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .filter_map(|task| {
                entries.get(task).map(|row| StoredEntry {
                    task: task.clone(),
                    last: row.last,
                })
            })
            .collect();
        Ok(result)
    }

    async fn lock_entries(&self, tasks: &[String]) -> Result<Box<dyn EntryLock>, StorageError> {
        // Sorted, so concurrent lockers always acquire in the same order.
        let names: BTreeSet<&String> = tasks.iter().collect();

        let slots: Vec<(String, Arc<Mutex<()>>)> = {
            let entries = self
                .entries
                .read()
                .map_err(|_| StorageError::LockPoisoned)?;
            names
                .into_iter()
                .filter_map(|task| {
                    entries
                        .get(task)
                        .map(|row| (task.clone(), Arc::clone(&row.lock)))
                })
                .collect()
        };

        let mut guards = Vec::with_capacity(slots.len());
        for (task, lock) in slots {
            guards.push((task, lock.lock_owned().await));
        }

        // Read under the locks; a row may have been removed while waiting.
        let rows = {
            let entries = self
                .entries
                .read()
                .map_err(|_| StorageError::LockPoisoned)?;
            guards
                .iter()
                .filter_map(|(task, _)| {
                    entries.get(task).map(|row| StoredEntry {
                        task: task.clone(),
                        last: row.last,
                    })
                })
                .collect()
        };

        Ok(Box::new(MemoryEntryLock {
            table: Arc::clone(&self.entries),
            clock: Arc::clone(&self.clock),
            guards,
            rows,
            pending: HashMap::new(),
            committed: false,
        }))
    }

    async fn upsert_host(&self, host: StoredHost) -> Result<StoredHost, StorageError> {
        let mut hosts = self.hosts.write().map_err(|_| StorageError::LockPoisoned)?;
        let stored = hosts.entry(host.id).or_insert(host);
        Ok(stored.clone())
    }

    async fn touch_host(&self, id: &HostId, last_seen: DateTime<Utc>) -> Result<(), StorageError> {
        let mut hosts = self.hosts.write().map_err(|_| StorageError::LockPoisoned)?;
        let host = hosts
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(format!("host: {}", id)))?;
        host.last_seen = last_seen;
        Ok(())
    }

    async fn list_hosts(&self) -> Result<Vec<StoredHost>, StorageError> {
        let hosts = self.hosts.read().map_err(|_| StorageError::LockPoisoned)?;
        let mut result: Vec<_> = hosts.values().cloned().collect();
        result.sort_by(|a, b| a.started.cmp(&b.started));
        Ok(result)
    }
}

/// Row locks on in-memory entries. Pending updates are applied on commit.
struct MemoryEntryLock {
    table: EntryTable,
    clock: Clock,
    guards: Vec<(String, OwnedMutexGuard<()>)>,
    rows: Vec<StoredEntry>,
    pending: HashMap<String, DateTime<Utc>>,
    committed: bool,
}

#[async_trait]
impl EntryLock for MemoryEntryLock {
    fn entries(&self) -> &[StoredEntry] {
        &self.rows
    }

    async fn mark_run(&mut self, tasks: &[String]) -> Result<u64, StorageError> {
        if self.committed {
            return Err(StorageError::Other("lock already committed".into()));
        }

        let now = read_clock(&self.clock)?;
        let mut updated = 0;
        for task in tasks {
            if !self.rows.iter().any(|row| &row.task == task) {
                return Err(StorageError::NotFound(format!("locked entry: {}", task)));
            }
            if self.pending.insert(task.clone(), now).is_none() {
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn commit(&mut self) -> Result<(), StorageError> {
        if self.committed {
            return Err(StorageError::Other("lock already committed".into()));
        }

        {
            let mut entries = self
                .table
                .write()
                .map_err(|_| StorageError::LockPoisoned)?;
            for (task, time) in self.pending.drain() {
                if let Some(row) = entries.get_mut(&task) {
                    // Never move `last` backwards.
                    row.last = Some(row.last.map_or(time, |last| last.max(time)));
                }
            }
        }

        self.committed = true;
        self.guards.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;

    fn names(tasks: &[&str]) -> Vec<String> {
        tasks.iter().map(|t| t.to_string()).collect()
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_create_entry_is_idempotent() {
        let storage = InMemoryStorage::new();

        assert!(storage.create_entry("backup").await.unwrap());
        assert!(!storage.create_entry("backup").await.unwrap());
        assert_eq!(storage.entry_count().unwrap(), 1);

        let rows = storage.list_entries(&names(&["backup"])).await.unwrap();
        assert_eq!(
            rows,
            vec![StoredEntry {
                task: "backup".into(),
                last: None
            }]
        );
    }

    #[tokio::test]
    async fn test_list_entries_skips_missing_rows() {
        let storage = InMemoryStorage::new();
        storage.create_entry("a").await.unwrap();

        let rows = storage.list_entries(&names(&["a", "b"])).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].task, "a");
    }

    #[tokio::test]
    async fn test_pinned_clock() {
        let storage = InMemoryStorage::new();
        storage.set_time(noon()).unwrap();
        assert_eq!(storage.now().await.unwrap(), noon());

        let later = storage.advance(TimeDelta::seconds(3)).unwrap();
        assert_eq!(later, noon() + TimeDelta::seconds(3));
        assert_eq!(storage.now().await.unwrap(), later);
    }

    #[tokio::test]
    async fn test_mark_run_applies_on_commit() {
        let storage = InMemoryStorage::new();
        storage.set_time(noon()).unwrap();
        storage.create_entry("a").await.unwrap();
        storage.create_entry("b").await.unwrap();

        let mut lock = storage.lock_entries(&names(&["a", "b"])).await.unwrap();
        assert_eq!(lock.entries().len(), 2);
        assert_eq!(lock.mark_run(&names(&["a"])).await.unwrap(), 1);

        // Not visible before commit.
        let rows = storage.list_entries(&names(&["a"])).await.unwrap();
        assert_eq!(rows[0].last, None);

        lock.commit().await.unwrap();

        let rows = storage.list_entries(&names(&["a", "b"])).await.unwrap();
        assert_eq!(rows[0].last, Some(noon()));
        assert_eq!(rows[1].last, None);
    }

    #[tokio::test]
    async fn test_drop_without_commit_rolls_back() {
        let storage = InMemoryStorage::new();
        storage.create_entry("a").await.unwrap();

        {
            let mut lock = storage.lock_entries(&names(&["a"])).await.unwrap();
            lock.mark_run(&names(&["a"])).await.unwrap();
        }

        let rows = storage.list_entries(&names(&["a"])).await.unwrap();
        assert_eq!(rows[0].last, None);

        // Locks were released.
        let mut lock = storage.lock_entries(&names(&["a"])).await.unwrap();
        lock.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_mark_run_rejects_unlocked_task() {
        let storage = InMemoryStorage::new();
        storage.create_entry("a").await.unwrap();
        storage.create_entry("b").await.unwrap();

        let mut lock = storage.lock_entries(&names(&["a"])).await.unwrap();
        let result = lock.mark_run(&names(&["b"])).await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_double_commit_fails() {
        let storage = InMemoryStorage::new();
        storage.create_entry("a").await.unwrap();

        let mut lock = storage.lock_entries(&names(&["a"])).await.unwrap();
        lock.commit().await.unwrap();
        assert!(matches!(lock.commit().await, Err(StorageError::Other(_))));
    }

    #[tokio::test]
    async fn test_last_never_moves_backwards() {
        let storage = InMemoryStorage::new();
        storage.create_entry("a").await.unwrap();

        storage.set_time(noon()).unwrap();
        let mut lock = storage.lock_entries(&names(&["a"])).await.unwrap();
        lock.mark_run(&names(&["a"])).await.unwrap();
        lock.commit().await.unwrap();

        storage.set_time(noon() - TimeDelta::minutes(1)).unwrap();
        let mut lock = storage.lock_entries(&names(&["a"])).await.unwrap();
        lock.mark_run(&names(&["a"])).await.unwrap();
        lock.commit().await.unwrap();

        let rows = storage.list_entries(&names(&["a"])).await.unwrap();
        assert_eq!(rows[0].last, Some(noon()));
    }

    #[tokio::test]
    async fn test_lock_blocks_second_locker() {
        let storage = Arc::new(InMemoryStorage::new());
        storage.create_entry("a").await.unwrap();

        let mut first = storage.lock_entries(&names(&["a"])).await.unwrap();

        let contender = {
            let storage = storage.clone();
            tokio::spawn(async move {
                let lock = storage.lock_entries(&names(&["a"])).await.unwrap();
                lock.entries()[0].last
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        storage.set_time(noon()).unwrap();
        first.mark_run(&names(&["a"])).await.unwrap();
        first.commit().await.unwrap();

        // The second locker sees the committed value.
        assert_eq!(contender.await.unwrap(), Some(noon()));
    }

    #[tokio::test]
    async fn test_reads_do_not_wait_for_locks() {
        let storage = InMemoryStorage::new();
        storage.create_entry("a").await.unwrap();

        let _lock = storage.lock_entries(&names(&["a"])).await.unwrap();
        let rows = tokio::time::timeout(
            Duration::from_millis(100),
            storage.list_entries(&names(&["a"])),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_removed_row_is_not_reported_under_lock() {
        let storage = InMemoryStorage::new();
        storage.create_entry("a").await.unwrap();
        storage.create_entry("b").await.unwrap();
        assert!(storage.remove_entry("b").unwrap());

        let lock = storage.lock_entries(&names(&["a", "b"])).await.unwrap();
        assert_eq!(lock.entries().len(), 1);
        assert_eq!(lock.entries()[0].task, "a");
    }

    #[tokio::test]
    async fn test_upsert_host_keeps_first_row() {
        let storage = InMemoryStorage::new();
        let id = HostId::new();

        let first = storage.upsert_host(StoredHost::new(id, noon())).await.unwrap();
        let second = storage
            .upsert_host(StoredHost::new(id, noon() + TimeDelta::hours(1)))
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(storage.list_hosts().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_touch_host() {
        let storage = InMemoryStorage::new();
        let id = HostId::new();
        storage.upsert_host(StoredHost::new(id, noon())).await.unwrap();

        let later = noon() + TimeDelta::seconds(20);
        storage.touch_host(&id, later).await.unwrap();

        let hosts = storage.list_hosts().await.unwrap();
        assert_eq!(hosts[0].last_seen, later);
        assert_eq!(hosts[0].started, noon());
    }

    #[tokio::test]
    async fn test_touch_unknown_host_fails() {
        let storage = InMemoryStorage::new();
        let result = storage.touch_host(&HostId::new(), noon()).await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }
}
