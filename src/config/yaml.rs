//! YAML configuration parsing.
//!
//! One file describes a dbcron host: where the shared database lives, the
//! scheduler settings and the command tasks to register. Every host in a
//! fleet should load the same file.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use super::error::ConfigError;
use crate::core::schedule::Schedule;

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DbcronConfig {
    /// Shared storage backend.
    pub storage: StorageConfig,
    /// Timezone cron expressions are evaluated in (default: UTC).
    pub timezone: Option<String>,
    /// Worker pool size (default: 4).
    pub pool_size: Option<usize>,
    /// Seconds to wait for running tasks on shutdown (default: 30).
    pub shutdown_timeout_secs: Option<u64>,
    /// Log filter directive used when `RUST_LOG` is unset.
    pub log_filter: Option<String>,
    /// Tasks to register.
    pub tasks: Vec<TaskConfig>,
}

impl DbcronConfig {
    /// The shutdown timeout, if configured.
    pub fn shutdown_timeout(&self) -> Option<Duration> {
        self.shutdown_timeout_secs.map(Duration::from_secs)
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StorageConfig {
    /// In-memory storage (single host, non-persistent).
    #[serde(rename = "memory")]
    #[default]
    Memory,
    /// SQLite storage.
    #[serde(rename = "sqlite")]
    Sqlite {
        /// Path to the database file.
        path: String,
    },
    /// PostgreSQL storage.
    #[serde(rename = "postgres")]
    Postgres {
        /// Connection URL.
        url: String,
    },
}

impl StorageConfig {
    /// Backend name as written in the file.
    pub fn kind(&self) -> &'static str {
        match self {
            StorageConfig::Memory => "memory",
            StorageConfig::Sqlite { .. } => "sqlite",
            StorageConfig::Postgres { .. } => "postgres",
        }
    }
}

/// A command task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Fleet-wide unique task name.
    pub name: String,
    /// Cron expression or shortcut.
    pub cron: String,
    /// Program to run.
    pub command: String,
    /// Program arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory.
    pub working_dir: Option<String>,
    /// Kill the command after this many seconds.
    pub timeout_secs: Option<u64>,
    /// Extra environment variables.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

/// YAML configuration loader.
pub struct YamlLoader;

impl YamlLoader {
    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<DbcronConfig, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::FileReadError {
            path: path.to_path_buf(),
            source,
        })?;

        let config: DbcronConfig =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::YamlFileError {
                path: path.to_path_buf(),
                source,
            })?;
        Self::validate(&config)?;
        Ok(config)
    }

    /// Parse and validate a configuration from a YAML string.
    pub fn parse(yaml: &str) -> Result<DbcronConfig, ConfigError> {
        let config: DbcronConfig = serde_yaml::from_str(yaml)?;
        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate a configuration.
    pub fn validate(config: &DbcronConfig) -> Result<(), ConfigError> {
        if config.pool_size == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "pool_size must be at least 1".into(),
            ));
        }

        let timezone = config.timezone.as_deref().unwrap_or("UTC");
        if timezone.parse::<chrono_tz::Tz>().is_err() {
            return Err(ConfigError::InvalidConfig(format!(
                "unknown timezone '{}'",
                timezone
            )));
        }

        match &config.storage {
            StorageConfig::Sqlite { path } if path.is_empty() => {
                return Err(ConfigError::MissingField("storage.path".into()));
            }
            StorageConfig::Postgres { url } if url.is_empty() => {
                return Err(ConfigError::MissingField("storage.url".into()));
            }
            _ => {}
        }

        let mut seen = HashSet::new();
        for task in &config.tasks {
            if task.name.is_empty() {
                return Err(ConfigError::MissingField("tasks[].name".into()));
            }
            if !seen.insert(task.name.as_str()) {
                return Err(ConfigError::InvalidConfig(format!(
                    "duplicate task name '{}'",
                    task.name
                )));
            }
            if task.command.trim().is_empty() {
                return Err(ConfigError::InvalidConfig(format!(
                    "task '{}' has an empty command",
                    task.name
                )));
            }
            if task.timeout_secs == Some(0) {
                return Err(ConfigError::InvalidConfig(format!(
                    "task '{}' has a zero timeout",
                    task.name
                )));
            }
            Schedule::new(task.cron.as_str()).map_err(|e| {
                ConfigError::InvalidConfig(format!("task '{}': {}", task.name, e))
            })?;
        }

        Ok(())
    }
}
