//! Common test utilities shared across integration tests.

#![allow(dead_code)]

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use dbcron::SLEEPY_TIME;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// A fixed UTC time on 2024-01-01.
pub fn at(hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, hour, minute, second)
        .unwrap()
}

/// `count` tick times on the SLEEPY_TIME grid, starting at `from`.
pub fn tick_grid(from: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
    let step = TimeDelta::from_std(SLEEPY_TIME).unwrap();
    (0..count as i32).map(|i| from + step * i).collect()
}

/// Wait for a counter to reach `expected`, polling every 10ms.
///
/// # Panics
///
/// Panics if the timeout is reached first.
pub async fn wait_for_count(counter: &AtomicU32, expected: u32, timeout: Duration) {
    let start = tokio::time::Instant::now();
    loop {
        let current = counter.load(Ordering::SeqCst);
        if current >= expected {
            return;
        }
        if start.elapsed() > timeout {
            panic!(
                "Timeout waiting for count {}, current count: {}",
                expected, current
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
