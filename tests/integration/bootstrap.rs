//! Bootstrap scenario integration tests.
//!
//! Tests that verify hosts converge on shared rows at startup and that a
//! restarted host picks up where the fleet left off.

use crate::common::at;
use dbcron::testing::{CountingTask, TestHarness};
use dbcron::{InMemoryStorage, Scheduler, SchedulerConfig, Storage};
use std::sync::Arc;

/// Test: Concurrent first-time bootstrap creates exactly one row per task.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_bootstrap_converges() {
    let storage = Arc::new(InMemoryStorage::new());
    storage.set_time(at(9, 0, 0)).unwrap();

    let mut handles = Vec::new();
    for _ in 0..5 {
        let storage = Arc::clone(&storage);
        handles.push(tokio::spawn(async move {
            let mut scheduler = Scheduler::with_storage(storage);
            scheduler.configure(SchedulerConfig::default());
            scheduler
                .register("report", "* * * * *", CountingTask::new())
                .unwrap();
            scheduler
                .register("cleanup", "@hourly", CountingTask::new())
                .unwrap();
            scheduler.bootstrap().await
        }));
    }

    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(storage.entry_count().unwrap(), 2);
    assert_eq!(storage.list_hosts().await.unwrap().len(), 5);
}

/// Test: A restarted host imports `last` and does not run again early.
#[tokio::test]
async fn test_restarted_host_imports_last() {
    let mut first = TestHarness::new();
    first
        .register("report", "* * * * *", CountingTask::new())
        .unwrap();
    first.bootstrap_at(at(9, 0, 0)).await.unwrap();
    assert_eq!(first.tick_at(at(9, 0, 0)).await.unwrap().ran_count(), 1);

    // Same storage, new process.
    let mut restarted = first.another_host();
    drop(first);
    restarted
        .register("report", "* * * * *", CountingTask::new())
        .unwrap();
    restarted.bootstrap_at(at(9, 0, 3)).await.unwrap();

    let entry = restarted.scheduler().entry("report").unwrap();
    assert_eq!(entry.last(), Some(at(9, 0, 0)));

    let report = restarted.tick_at(at(9, 0, 3)).await.unwrap();
    assert_eq!(report.ran_count(), 0);

    let report = restarted.tick_at(at(9, 0, 30)).await.unwrap();
    assert_eq!(report.ran_count(), 1);
}

/// Test: A host joining mid-minute waits for the top of the minute.
#[tokio::test]
async fn test_new_task_waits_for_top_of_minute() {
    let mut harness = TestHarness::new();
    harness
        .register("report", "* * * * *", CountingTask::new())
        .unwrap();
    harness.bootstrap_at(at(9, 0, 21)).await.unwrap();

    for second in [21, 24, 27, 57] {
        let report = harness.tick_at(at(9, 0, second)).await.unwrap();
        assert_eq!(report.ran_count(), 0, "ran at 09:00:{}", second);
    }

    let report = harness.tick_at(at(9, 1, 0)).await.unwrap();
    assert_eq!(report.ran_count(), 1);
}

/// Test: Host rows record the process and the heartbeat.
#[tokio::test]
async fn test_host_row_describes_process() {
    let mut harness = TestHarness::new();
    harness.bootstrap_at(at(9, 0, 0)).await.unwrap();

    let hosts = harness.storage().list_hosts().await.unwrap();
    assert_eq!(hosts.len(), 1);
    assert_eq!(hosts[0].id, harness.scheduler().host_id());
    assert_eq!(hosts[0].pid, std::process::id());
    assert_eq!(hosts[0].started, at(9, 0, 0));

    harness.scheduler_mut().heartbeat(at(9, 0, 18)).await.unwrap();
    let hosts = harness.storage().list_hosts().await.unwrap();
    assert_eq!(hosts[0].last_seen, at(9, 0, 18));
    assert_eq!(hosts[0].started, at(9, 0, 0));
}
