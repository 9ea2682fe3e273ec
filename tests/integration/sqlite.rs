//! SQLite backend integration tests.
//!
//! Two storages opened on one database file stand in for two hosts.

use crate::common::at;
use dbcron::testing::{CountingTask, wait_until};
use dbcron::{Scheduler, SchedulerConfig, SqliteStorage, Storage};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::time::Duration;

async fn host_on(path: &Path) -> (Scheduler<SqliteStorage>, CountingTask) {
    let storage = SqliteStorage::new(path).await.unwrap();
    let mut scheduler = Scheduler::new(storage);
    scheduler.configure(SchedulerConfig::default().with_pool_size(2));

    let task = CountingTask::new();
    scheduler
        .register("report", "* * * * *", task.clone())
        .unwrap();
    scheduler.bootstrap().await.unwrap();
    (scheduler, task)
}

/// Test: Hosts on one database file dispatch a due task once.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_hosts_share_database() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dbcron.db");

    let (mut first, first_task) = host_on(&path).await;
    let (mut second, second_task) = host_on(&path).await;

    let now = at(9, 0, 0);
    let (a, b) = tokio::join!(
        tokio::spawn(async move { first.tick(now).await.map(|r| r.ran_count()) }),
        tokio::spawn(async move { second.tick(now).await.map(|r| r.ran_count()) }),
    );
    let dispatched = a.unwrap().unwrap() + b.unwrap().unwrap();
    assert_eq!(dispatched, 1);

    // The dispatch is stamped with database time.
    let storage = SqliteStorage::new(&path).await.unwrap();
    let rows = storage.list_entries(&["report".to_string()]).await.unwrap();
    let last = rows[0].last.unwrap();
    assert!(last > now);

    assert_eq!(storage.list_hosts().await.unwrap().len(), 2);

    let ran_once = wait_until(Duration::from_secs(5), || async {
        first_task.count() + second_task.count() == 1
    })
    .await;
    assert!(ran_once);
    storage.close().await;
}

/// Test: Entry and host rows survive reopening the database.
#[tokio::test]
async fn test_state_survives_reconnect() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dbcron.db");

    let (mut scheduler, _task) = host_on(&path).await;
    let host = scheduler.host_id();
    let report = scheduler.tick(at(9, 0, 0)).await.unwrap();
    assert_eq!(report.ran_count(), 1);
    scheduler.storage().close().await;

    let storage = SqliteStorage::new(&path).await.unwrap();
    let rows = storage.list_entries(&["report".to_string()]).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].last.is_some());

    let hosts = storage.list_hosts().await.unwrap();
    assert_eq!(hosts.len(), 1);
    assert_eq!(hosts[0].id, host);

    // A restarted host imports the dispatch and waits out the interval.
    let (mut restarted, restarted_task) = host_on(&path).await;
    let report = restarted.tick(rows[0].last.unwrap()).await.unwrap();
    assert_eq!(report.ran_count(), 0);
    assert_eq!(restarted_task.counter().load(Ordering::SeqCst), 0);
}
