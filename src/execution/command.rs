//! External command task implementation.
//!
//! [`CommandTask`] wraps shell commands and external executables so they can
//! be registered as crontab entries. The builder configures arguments,
//! environment variables, a working directory and an optional timeout.
//!
//! ```rust
//! use dbcron::CommandTask;
//! use std::time::Duration;
//!
//! let task = CommandTask::builder("pg_dump")
//!     .args(["--format=custom", "--file=/backups/nightly.dump", "app"])
//!     .env("PGHOST", "db.internal")
//!     .timeout(Duration::from_secs(3600))
//!     .build();
//!
//! assert_eq!(task.program(), "pg_dump");
//! ```
//!
//! A non-zero exit status becomes [`TaskError::CommandFailed`] carrying the
//! exit code and stderr; hitting the timeout becomes [`TaskError::Timeout`]
//! and kills the child process. Output is logged at debug level.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::core::task::{Task, TaskError};

/// A task that executes an external command.
#[derive(Debug, Clone)]
pub struct CommandTask {
    /// Program to execute
    program: String,
    /// Command arguments
    args: Vec<String>,
    /// Environment variables
    environment: BTreeMap<String, String>,
    /// Working directory
    working_dir: Option<PathBuf>,
    /// Execution timeout
    timeout: Option<Duration>,
    /// Rendered command line, used as the description
    command_line: String,
}

impl CommandTask {
    /// Create a new builder for a command task.
    pub fn builder(program: impl Into<String>) -> CommandTaskBuilder {
        CommandTaskBuilder::new(program)
    }

    /// Get the program being executed.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Get the command arguments.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Get the environment variables set for the command.
    pub fn environment(&self) -> &BTreeMap<String, String> {
        &self.environment
    }

    /// Get the working directory.
    pub fn working_dir(&self) -> Option<&PathBuf> {
        self.working_dir.as_ref()
    }

    /// Get the timeout duration.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

#[async_trait]
impl Task for CommandTask {
    async fn run(&self) -> Result<(), TaskError> {
        let mut cmd = Command::new(&self.program);

        cmd.args(&self.args);
        cmd.envs(&self.environment);

        if let Some(ref dir) = self.working_dir {
            cmd.current_dir(dir);
        }

        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let output = match self.timeout {
            Some(duration) => timeout(duration, cmd.output())
                .await
                .map_err(|_| TaskError::Timeout(duration))?
                .map_err(|e| TaskError::ExecutionFailed(e.to_string()))?,
            None => cmd
                .output()
                .await
                .map_err(|e| TaskError::ExecutionFailed(e.to_string()))?,
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        for line in stdout.lines() {
            debug!(command = %self.command_line, "stdout: {}", line);
        }
        for line in stderr.lines() {
            debug!(command = %self.command_line, "stderr: {}", line);
        }

        if output.status.success() {
            Ok(())
        } else {
            // Killed by a signal has no exit code.
            let code = output.status.code().unwrap_or(-1);
            Err(TaskError::CommandFailed { code, stderr })
        }
    }

    fn description(&self) -> Option<&str> {
        Some(&self.command_line)
    }
}

/// Builder for creating `CommandTask` instances.
#[derive(Debug, Clone)]
pub struct CommandTaskBuilder {
    program: String,
    args: Vec<String>,
    environment: BTreeMap<String, String>,
    working_dir: Option<PathBuf>,
    timeout: Option<Duration>,
}

impl CommandTaskBuilder {
    /// Create a new builder with the given program.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            environment: BTreeMap::new(),
            working_dir: None,
            timeout: None,
        }
    }

    /// Add a single argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add a single environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    /// Add several environment variables.
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.environment
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Set the working directory.
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Set the execution timeout.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Build the `CommandTask`.
    pub fn build(self) -> CommandTask {
        let command_line = std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");

        CommandTask {
            program: self.program,
            args: self.args,
            environment: self.environment,
            working_dir: self.working_dir,
            timeout: self.timeout,
            command_line,
        }
    }
}
