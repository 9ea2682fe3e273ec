//! Cron expression parsing and fire time calculation.
//!
//! Supports standard 5-field cron, extended 6-field cron (with seconds) and
//! the usual shortcuts (@daily, @hourly, etc.). Expressions are evaluated in
//! the schedule's timezone; every timestamp crossing this API is UTC.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use std::str::FromStr;
use thiserror::Error;

/// Errors that can occur when parsing or using schedules.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// Invalid cron expression.
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),

    /// Invalid timezone.
    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),

    /// No more occurrences.
    #[error("no more occurrences")]
    NoMoreOccurrences,
}

/// A parsed cron schedule bound to an interpretation timezone.
#[derive(Debug, Clone)]
pub struct Schedule {
    /// The original expression string.
    expression: String,
    /// The timezone the expression is evaluated in.
    timezone: Tz,
    cron: Box<CronSchedule>,
}

impl Schedule {
    /// Create a new schedule evaluated in UTC.
    ///
    /// Supports:
    /// - Standard 5-field cron: `minute hour day month weekday`
    /// - Extended 6-field cron: `second minute hour day month weekday`
    /// - Shortcuts: `@yearly`, `@monthly`, `@weekly`, `@daily`, `@hourly`
    pub fn new(expression: impl Into<String>) -> Result<Self, ScheduleError> {
        Self::in_timezone(expression, Tz::UTC)
    }

    /// Create a new schedule with a timezone given by name.
    pub fn with_timezone(
        expression: impl Into<String>,
        timezone: &str,
    ) -> Result<Self, ScheduleError> {
        let tz = timezone
            .parse::<Tz>()
            .map_err(|_| ScheduleError::InvalidTimezone(timezone.to_string()))?;
        Self::in_timezone(expression, tz)
    }

    /// Create a new schedule evaluated in `timezone`.
    pub fn in_timezone(expression: impl Into<String>, timezone: Tz) -> Result<Self, ScheduleError> {
        let expression = expression.into();
        let cron = Self::parse_expression(&expression)?;

        Ok(Self {
            expression,
            timezone,
            cron: Box::new(cron),
        })
    }

    /// The same expression evaluated in another timezone.
    pub fn rezoned(&self, timezone: Tz) -> Self {
        Self {
            expression: self.expression.clone(),
            timezone,
            cron: self.cron.clone(),
        }
    }

    /// Parse the expression, expanding shortcuts first.
    fn parse_expression(expression: &str) -> Result<CronSchedule, ScheduleError> {
        let trimmed = expression.trim();

        if trimmed.starts_with('@') {
            return Self::parse_shortcut(trimmed);
        }

        Self::parse_cron(trimmed)
    }

    /// Parse a shortcut expression (@daily, @hourly, etc.).
    fn parse_shortcut(expression: &str) -> Result<CronSchedule, ScheduleError> {
        match expression.to_lowercase().as_str() {
            "@yearly" | "@annually" => Self::parse_cron("0 0 1 1 *"),
            "@monthly" => Self::parse_cron("0 0 1 * *"),
            "@weekly" => Self::parse_cron("0 0 * * SUN"),
            "@daily" | "@midnight" => Self::parse_cron("0 0 * * *"),
            "@hourly" => Self::parse_cron("0 * * * *"),
            _ => Err(ScheduleError::InvalidCron(format!(
                "unknown shortcut: {}",
                expression
            ))),
        }
    }

    /// Parse a 5- or 6-field cron expression.
    fn parse_cron(expression: &str) -> Result<CronSchedule, ScheduleError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();

        let cron_expr = match fields.len() {
            // Minute granularity: fire on second zero.
            5 => format!("0 {}", fields.join(" ")),
            6 => fields.join(" "),
            _ => {
                return Err(ScheduleError::InvalidCron(format!(
                    "expected 5 or 6 fields, got {}",
                    fields.len()
                )));
            }
        };

        CronSchedule::from_str(&cron_expr).map_err(|e| ScheduleError::InvalidCron(e.to_string()))
    }

    /// Get the first fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
        let local_time = after.with_timezone(&self.timezone);
        self.cron
            .after(&local_time)
            .next()
            .map(|dt| dt.with_timezone(&Utc))
            .ok_or(ScheduleError::NoMoreOccurrences)
    }

    /// Get the last fire time strictly before `before`.
    pub fn previous_before(&self, before: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
        let local_time = before.with_timezone(&self.timezone);
        self.cron
            .after(&local_time)
            .next_back()
            .map(|dt| dt.with_timezone(&Utc))
            .ok_or(ScheduleError::NoMoreOccurrences)
    }

    /// Get the next N fire times after the given time.
    pub fn next_n_after(&self, after: DateTime<Utc>, n: usize) -> Vec<DateTime<Utc>> {
        let local_time = after.with_timezone(&self.timezone);
        self.cron
            .after(&local_time)
            .take(n)
            .map(|dt| dt.with_timezone(&Utc))
            .collect()
    }

    /// Get the original expression string.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Get the timezone.
    pub fn timezone(&self) -> Tz {
        self.timezone
    }
}
