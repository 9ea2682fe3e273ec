//! Core scheduling types: cron schedules, crontab entries and task bodies.

pub mod entry;
pub mod schedule;
pub mod task;
pub mod types;
