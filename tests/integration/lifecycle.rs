//! Tick loop lifecycle integration tests.
//!
//! These run the real loop with a pinned storage clock and tokio's paused
//! timer, so inter-tick sleeps complete instantly.

use crate::common::{at, wait_for_count};
use dbcron::testing::CountingTask;
use dbcron::{InMemoryStorage, Scheduler, SchedulerConfig, SchedulerState, Storage};
use std::sync::Arc;
use std::time::Duration;

fn scheduler_at(
    storage: &Arc<InMemoryStorage>,
    time: chrono::DateTime<chrono::Utc>,
) -> Scheduler<InMemoryStorage> {
    storage.set_time(time).unwrap();
    let mut scheduler = Scheduler::with_storage(Arc::clone(storage));
    scheduler.configure(SchedulerConfig::default().with_pool_size(2));
    scheduler
}

/// Test: The loop runs due tasks, follows the clock and stops on request.
#[tokio::test(start_paused = true)]
async fn test_loop_runs_until_stopped() {
    let storage = Arc::new(InMemoryStorage::new());
    let mut scheduler = scheduler_at(&storage, at(9, 0, 0));
    let task = CountingTask::new();
    let runs = task.counter();
    scheduler.register("report", "* * * * *", task).unwrap();

    let (handle, join) = scheduler.spawn();
    assert!(handle.wait_for(SchedulerState::Running).await);
    wait_for_count(&runs, 1, Duration::from_secs(10)).await;

    // Half a period later the task is due again.
    storage.set_time(at(9, 0, 30)).unwrap();
    wait_for_count(&runs, 2, Duration::from_secs(10)).await;

    handle.stop();
    join.await.unwrap().unwrap();

    assert_eq!(handle.state(), SchedulerState::Stopped);
    let rows = storage.list_entries(&["report".to_string()]).await.unwrap();
    assert_eq!(rows[0].last, Some(at(9, 0, 30)));
}

/// Test: The loop refreshes the host row once it is older than HOST_ALIVE_TIME.
#[tokio::test(start_paused = true)]
async fn test_loop_sends_heartbeats() {
    let storage = Arc::new(InMemoryStorage::new());
    let scheduler = scheduler_at(&storage, at(9, 0, 0));
    let host = scheduler.host_id();

    let (handle, join) = scheduler.spawn();
    assert!(handle.wait_for(SchedulerState::Running).await);

    storage.set_time(at(9, 0, 20)).unwrap();
    let mut refreshed = false;
    for _ in 0..100 {
        let hosts = storage.list_hosts().await.unwrap();
        if hosts.iter().any(|h| h.id == host && h.last_seen == at(9, 0, 20)) {
            refreshed = true;
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    assert!(refreshed);

    handle.stop();
    join.await.unwrap().unwrap();
}

/// Test: Stop requested before start still lets one iteration complete.
#[tokio::test(start_paused = true)]
async fn test_stop_before_start() {
    let storage = Arc::new(InMemoryStorage::new());
    let mut scheduler = scheduler_at(&storage, at(9, 0, 0));
    let task = CountingTask::new();
    let runs = task.counter();
    scheduler.register("report", "* * * * *", task).unwrap();

    let handle = scheduler.handle();
    handle.stop();
    scheduler.start().await.unwrap();

    assert_eq!(scheduler.state(), SchedulerState::Stopped);
    let rows = storage.list_entries(&["report".to_string()]).await.unwrap();
    assert_eq!(rows[0].last, Some(at(9, 0, 0)));
    // The pool was drained before start returned.
    assert_eq!(runs.load(std::sync::atomic::Ordering::SeqCst), 1);
}

/// Test: Shutdown waits for running bodies up to the timeout.
#[tokio::test(start_paused = true)]
async fn test_shutdown_drains_pool() {
    let storage = Arc::new(InMemoryStorage::new());
    storage.set_time(at(9, 0, 0)).unwrap();
    let mut scheduler = Scheduler::with_storage(Arc::clone(&storage));
    scheduler.configure(
        SchedulerConfig::default().with_shutdown_timeout(Duration::from_secs(60)),
    );
    let task = CountingTask::new().with_delay(Duration::from_secs(20));
    let runs = task.counter();
    scheduler.register("slow", "* * * * *", task).unwrap();

    let handle = scheduler.handle();
    handle.stop();
    scheduler.start().await.unwrap();

    assert_eq!(runs.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(scheduler.pool().available(), scheduler.pool().size());
}
