//! Configuration loading and parsing.
//!
//! This module provides the YAML configuration file read by the `dbcron`
//! binary: storage backend, scheduler settings and command tasks.

mod builder;
mod error;
mod yaml;

pub use builder::ConfigBuilder;
pub use error::ConfigError;
pub use yaml::{DbcronConfig, StorageConfig, TaskConfig, YamlLoader};
