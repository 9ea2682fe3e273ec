//! Scheduler builder from YAML configuration.
//!
//! Turns a [`DbcronConfig`] into scheduler settings and registered
//! [`CommandTask`]s.

use chrono_tz::Tz;
use std::time::Duration;

use super::error::ConfigError;
use super::yaml::{DbcronConfig, TaskConfig};
use crate::execution::CommandTask;
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::storage::Storage;

/// Builder for scheduler pieces from configuration.
pub struct ConfigBuilder;

impl ConfigBuilder {
    /// Scheduler settings, with defaults for anything unset.
    pub fn scheduler_config(config: &DbcronConfig) -> Result<SchedulerConfig, ConfigError> {
        let mut settings = SchedulerConfig::default();

        if let Some(name) = &config.timezone {
            let timezone = name
                .parse::<Tz>()
                .map_err(|_| ConfigError::InvalidConfig(format!("unknown timezone '{}'", name)))?;
            settings = settings.with_timezone(timezone);
        }
        if let Some(size) = config.pool_size {
            settings = settings.with_pool_size(size);
        }
        if let Some(timeout) = config.shutdown_timeout() {
            settings = settings.with_shutdown_timeout(timeout);
        }

        Ok(settings)
    }

    /// Build a CommandTask from TaskConfig.
    pub fn build_task(config: &TaskConfig) -> CommandTask {
        let mut builder = CommandTask::builder(&config.command)
            .args(&config.args)
            .envs(&config.environment);

        if let Some(dir) = &config.working_dir {
            builder = builder.working_dir(dir);
        }
        if let Some(secs) = config.timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }

        builder.build()
    }

    /// Register every configured task with `scheduler`.
    pub fn register_tasks<S: Storage + 'static>(
        config: &DbcronConfig,
        scheduler: &mut Scheduler<S>,
    ) -> Result<(), ConfigError> {
        for task in &config.tasks {
            scheduler
                .register(&task.name, &task.cron, Self::build_task(task))
                .map_err(|e| ConfigError::InvalidConfig(format!("task '{}': {}", task.name, e)))?;
        }
        Ok(())
    }
}
