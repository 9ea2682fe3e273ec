//! Task failure integration tests.
//!
//! A failing body is logged at the pool boundary and never reaches the
//! scheduler: the dispatch still counts and siblings are unaffected.

use crate::common::{at, wait_for_count};
use dbcron::testing::{CountingTask, FailingTask, TestHarness};
use dbcron::{TaskError, from_fn};
use std::sync::atomic::Ordering;
use std::time::Duration;

/// Test: Failing and panicking tasks are contained.
#[tokio::test]
async fn test_failures_do_not_affect_siblings() {
    let mut harness = TestHarness::new();

    let failing = FailingTask::always();
    let failing_calls = failing.calls();
    harness.register("failing", "* * * * *", failing).unwrap();

    harness
        .register(
            "panicking",
            "* * * * *",
            from_fn(|| async {
                if true {
                    panic!("task body panicked");
                }
                Ok::<(), TaskError>(())
            }),
        )
        .unwrap();

    let healthy = CountingTask::new();
    let healthy_runs = healthy.counter();
    harness.register("healthy", "* * * * *", healthy).unwrap();

    harness.bootstrap_at(at(9, 0, 0)).await.unwrap();
    let report = harness.tick_at(at(9, 0, 0)).await.unwrap();
    assert_eq!(report.ran_count(), 3);

    wait_for_count(&healthy_runs, 1, Duration::from_secs(5)).await;
    wait_for_count(&failing_calls, 1, Duration::from_secs(5)).await;

    for task in ["failing", "panicking", "healthy"] {
        assert_eq!(
            harness.last_run(task).await.unwrap(),
            Some(at(9, 0, 0)),
            "{} was not recorded",
            task
        );
    }

    // The next run is scheduled as usual.
    let report = harness.tick_at(at(9, 0, 30)).await.unwrap();
    assert_eq!(report.ran_count(), 3);
    wait_for_count(&failing_calls, 2, Duration::from_secs(5)).await;
    wait_for_count(&healthy_runs, 2, Duration::from_secs(5)).await;
}

/// Test: A task that recovers after failing keeps its schedule.
#[tokio::test]
async fn test_flaky_task_keeps_schedule() {
    let mut harness = TestHarness::new();
    let flaky = FailingTask::with_error(1, "database unavailable");
    let calls = flaky.calls();
    harness.register("flaky", "*/2 * * * *", flaky).unwrap();

    harness.bootstrap_at(at(9, 0, 0)).await.unwrap();
    assert_eq!(harness.tick_at(at(9, 0, 0)).await.unwrap().ran_count(), 1);
    assert_eq!(harness.tick_at(at(9, 0, 30)).await.unwrap().ran_count(), 0);
    assert_eq!(harness.tick_at(at(9, 1, 0)).await.unwrap().ran_count(), 1);

    wait_for_count(&calls, 2, Duration::from_secs(5)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

/// Test: A command exiting non-zero is just another failed run.
#[cfg(unix)]
#[tokio::test]
async fn test_failing_command() {
    use dbcron::CommandTask;
    use dbcron::testing::wait_until;

    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("ran");

    let mut harness = TestHarness::new();
    harness
        .register("false", "* * * * *", CommandTask::builder("false").build())
        .unwrap();
    harness
        .register(
            "touch",
            "* * * * *",
            CommandTask::builder("touch")
                .arg(marker.to_string_lossy())
                .build(),
        )
        .unwrap();

    harness.bootstrap_at(at(9, 0, 0)).await.unwrap();
    let report = harness.tick_at(at(9, 0, 0)).await.unwrap();
    assert_eq!(report.ran_count(), 2);

    let marker_path = marker.clone();
    assert!(
        wait_until(Duration::from_secs(5), move || {
            let marker_path = marker_path.clone();
            async move { marker_path.exists() }
        })
        .await
    );
    assert_eq!(harness.last_run("false").await.unwrap(), Some(at(9, 0, 0)));
}
