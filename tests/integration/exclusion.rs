//! Mutual exclusion across hosts.
//!
//! Several schedulers sharing one storage must dispatch exactly what a
//! single scheduler would, never running a task twice within its interval.

use crate::common::{at, tick_grid};
use chrono::{DateTime, TimeDelta, Utc};
use dbcron::SchedulerConfig;
use dbcron::testing::{CountingTask, TestHarness};
use std::collections::HashMap;

const TASKS: [(&str, &str); 5] = [
    ("every_minute", "* * * * *"),
    ("every_two_minutes", "*/2 * * * *"),
    ("quarter_past", "15 * * * *"),
    ("every_ten_seconds", "*/10 * * * * *"),
    ("hourly", "@hourly"),
];

fn host(pool_size: usize) -> TestHarness {
    TestHarness::with_config(SchedulerConfig::default().with_pool_size(pool_size))
}

fn register_all(harness: &mut TestHarness) {
    for (name, cron) in TASKS {
        harness.register(name, cron, CountingTask::new()).unwrap();
    }
}

/// Tick every host at every grid time, in host order. Returns each task's
/// dispatch times.
async fn simulate(
    hosts: &mut [TestHarness],
    ticks: &[DateTime<Utc>],
) -> HashMap<String, Vec<DateTime<Utc>>> {
    let mut dispatches: HashMap<String, Vec<DateTime<Utc>>> = HashMap::new();
    for host in hosts.iter_mut() {
        host.bootstrap_at(ticks[0]).await.unwrap();
    }

    for &now in ticks {
        for host in hosts.iter_mut() {
            let report = host.tick_at(now).await.unwrap();
            for task in report.ran() {
                dispatches.entry(task.to_string()).or_default().push(now);
            }
        }
    }
    dispatches
}

/// Test: A fleet dispatches the same runs as a lone host.
#[tokio::test]
async fn test_fleet_matches_single_host() {
    let ticks = tick_grid(at(9, 0, 0), 220);

    let mut single = vec![host(2)];
    register_all(&mut single[0]);
    let expected = simulate(&mut single, &ticks).await;

    let first = host(2);
    let mut fleet = vec![first.another_host(), first.another_host(), first];
    for harness in fleet.iter_mut() {
        register_all(harness);
    }
    let actual = simulate(&mut fleet, &ticks).await;

    assert!(!expected.is_empty());
    assert_eq!(actual, expected);
}

/// Test: No task is dispatched twice within half its period.
#[tokio::test]
async fn test_fleet_respects_interval() {
    let ticks = tick_grid(at(9, 0, 0), 220);
    let first = host(3);
    let mut fleet = vec![first.another_host(), first];
    for harness in fleet.iter_mut() {
        register_all(harness);
    }

    let dispatches = simulate(&mut fleet, &ticks).await;

    let every_minute = &dispatches["every_minute"];
    assert!(every_minute.len() >= 2);
    for pair in every_minute.windows(2) {
        assert!(pair[1] - pair[0] >= TimeDelta::seconds(30));
    }

    // Admitted as soon as 09:15 is within the grace window.
    assert_eq!(dispatches["quarter_past"], vec![at(9, 10, 0)]);
    assert!(!dispatches.contains_key("hourly"));
}

/// Test: Hosts ticking concurrently dispatch each due task once.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_hosts_dispatch_once() {
    let now = at(9, 55, 0);
    let first = host(2);
    let mut hosts: Vec<TestHarness> = (0..3).map(|_| first.another_host()).collect();
    hosts.push(first);

    for harness in hosts.iter_mut() {
        register_all(harness);
        harness.bootstrap_at(now).await.unwrap();
    }

    let mut handles = Vec::new();
    for mut harness in hosts {
        handles.push(tokio::spawn(async move {
            let report = harness.scheduler_mut().tick(now).await.unwrap();
            report.ran().map(String::from).collect::<Vec<_>>()
        }));
    }

    let mut ran = Vec::new();
    for handle in handles {
        ran.extend(handle.await.unwrap());
    }
    ran.sort();

    // quarter_past is not due before 10:15.
    assert_eq!(
        ran,
        vec![
            "every_minute",
            "every_ten_seconds",
            "every_two_minutes",
            "hourly"
        ]
    );
}
