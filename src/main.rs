//! dbcron - cron for a fleet of hosts sharing one database.
//!
//! Usage:
//!   dbcron run <config>       Run the scheduler
//!   dbcron validate <config>  Validate the configuration without running
//!   dbcron list <config>      List tasks and their next fire times
//!   dbcron hosts <config>     List scheduler hosts recorded in the database

use chrono::{TimeDelta, Utc};
use clap::{Parser, Subcommand};
use dbcron::{
    ConfigBuilder, DbcronConfig, HOST_ALIVE_TIME, InMemoryStorage, Schedule, Scheduler, Storage,
    StorageConfig, Task, YamlLoader,
};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Number of upcoming fire times shown by `list`.
const LIST_OCCURRENCES: usize = 3;

/// dbcron - cron for a fleet of hosts sharing one database
#[derive(Parser)]
#[command(name = "dbcron")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler
    Run {
        /// Path to the configuration file
        #[arg(value_name = "CONFIG")]
        config: PathBuf,

        /// Worker pool size (overrides the file)
        #[arg(short = 'p', long)]
        pool_size: Option<usize>,

        /// Timezone cron expressions are evaluated in (overrides the file)
        #[arg(long)]
        timezone: Option<String>,
    },

    /// Validate the configuration without running
    Validate {
        /// Path to the configuration file
        #[arg(value_name = "CONFIG")]
        config: PathBuf,
    },

    /// List tasks and their next fire times
    List {
        /// Path to the configuration file
        #[arg(value_name = "CONFIG")]
        config: PathBuf,
    },

    /// List scheduler hosts recorded in the database
    Hosts {
        /// Path to the configuration file
        #[arg(value_name = "CONFIG")]
        config: PathBuf,
    },
}

impl Commands {
    fn config_path(&self) -> &Path {
        match self {
            Commands::Run { config, .. }
            | Commands::Validate { config }
            | Commands::List { config }
            | Commands::Hosts { config } => config,
        }
    }
}

/// What to do once storage is open.
enum Action {
    Run,
    Hosts,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let path = cli.command.config_path().to_path_buf();

    let loaded = YamlLoader::load(&path);
    init_logging(
        loaded
            .as_ref()
            .ok()
            .and_then(|config| config.log_filter.as_deref()),
    );

    let mut config = match loaded {
        Ok(config) => config,
        Err(e) => {
            error!("Validation failed: {}", e);
            return Err(e.into());
        }
    };

    match cli.command {
        Commands::Run {
            pool_size,
            timezone,
            ..
        } => {
            if pool_size.is_some() {
                config.pool_size = pool_size;
            }
            if timezone.is_some() {
                config.timezone = timezone;
            }
            YamlLoader::validate(&config)?;
            open_storage(&config, Action::Run).await?;
        }
        Commands::Validate { .. } => {
            info!(
                "{} is valid: {} task(s)",
                path.display(),
                config.tasks.len()
            );
            for task in &config.tasks {
                info!("  - {} ({}): OK", task.name, task.cron);
            }
        }
        Commands::List { .. } => {
            list_tasks(&config)?;
        }
        Commands::Hosts { .. } => {
            open_storage(&config, Action::Hosts).await?;
        }
    }

    Ok(())
}

/// Install the fmt subscriber. `RUST_LOG` wins over the file's filter.
fn init_logging(fallback: Option<&str>) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback.unwrap_or("info")))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Open the configured storage backend and perform `action` on it.
async fn open_storage(
    config: &DbcronConfig,
    action: Action,
) -> Result<(), Box<dyn std::error::Error>> {
    match &config.storage {
        StorageConfig::Memory => {
            warn!("Using in-memory storage; tasks are not coordinated with other hosts");
            perform(InMemoryStorage::new(), config, action).await
        }
        #[cfg(feature = "sqlite")]
        StorageConfig::Sqlite { path } => {
            info!("Using SQLite storage at {}", path);
            let storage = dbcron::SqliteStorage::new(path).await?;
            perform(storage, config, action).await
        }
        #[cfg(feature = "postgres")]
        StorageConfig::Postgres { url } => {
            info!("Using PostgreSQL storage");
            let storage = dbcron::PostgresStorage::connect(url).await?;
            perform(storage, config, action).await
        }
        #[allow(unreachable_patterns)]
        other => Err(format!("dbcron was built without {} support", other.kind()).into()),
    }
}

async fn perform<S: Storage + 'static>(
    storage: S,
    config: &DbcronConfig,
    action: Action,
) -> Result<(), Box<dyn std::error::Error>> {
    match action {
        Action::Run => run_scheduler(storage, config).await,
        Action::Hosts => list_hosts(&storage).await,
    }
}

/// Run the scheduler until Ctrl+C.
async fn run_scheduler<S: Storage + 'static>(
    storage: S,
    config: &DbcronConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    if config.tasks.is_empty() {
        warn!("No tasks configured");
    }

    let mut scheduler = Scheduler::new(storage);
    scheduler.configure(ConfigBuilder::scheduler_config(config)?);
    ConfigBuilder::register_tasks(config, &mut scheduler)?;

    info!(
        host = %scheduler.host_id(),
        "Registered {} task(s) in {}",
        scheduler.entries().len(),
        scheduler.timezone()
    );
    info!("Press Ctrl+C to stop");

    let (handle, mut scheduler_task) = scheduler.spawn();

    let finished = tokio::select! {
        _ = tokio::signal::ctrl_c() => false,
        result = &mut scheduler_task => {
            result??;
            true
        }
    };

    if !finished {
        info!("Shutting down...");
        handle.stop();
        scheduler_task.await??;
    }

    info!("Goodbye!");
    Ok(())
}

/// List tasks with their next fire times.
fn list_tasks(config: &DbcronConfig) -> Result<(), Box<dyn std::error::Error>> {
    if config.tasks.is_empty() {
        println!("No tasks configured");
        return Ok(());
    }

    let settings = ConfigBuilder::scheduler_config(config)?;
    let now = Utc::now();

    for task in &config.tasks {
        let schedule = Schedule::in_timezone(task.cron.as_str(), settings.timezone)?;
        let command = ConfigBuilder::build_task(task);

        println!("{}", task.name);
        println!("  Schedule: {} ({})", schedule.expression(), schedule.timezone());
        println!("  Command: {}", command.description().unwrap_or_default());
        if let Some(secs) = task.timeout_secs {
            println!("  Timeout: {}s", secs);
        }
        for next in schedule.next_n_after(now, LIST_OCCURRENCES) {
            println!(
                "    next: {}",
                next.with_timezone(&settings.timezone).to_rfc3339()
            );
        }
        println!();
    }

    Ok(())
}

/// List host rows with their liveness.
async fn list_hosts<S: Storage>(storage: &S) -> Result<(), Box<dyn std::error::Error>> {
    let hosts = storage.list_hosts().await?;
    if hosts.is_empty() {
        println!("No hosts recorded");
        return Ok(());
    }

    let now = storage.now().await?;
    // A live host refreshes its row at least every HOST_ALIVE_TIME plus one tick.
    let threshold = TimeDelta::seconds(2 * HOST_ALIVE_TIME.as_secs() as i64);

    for host in &hosts {
        let status = if host.is_alive(now, threshold) {
            "alive"
        } else {
            "gone"
        };
        println!(
            "{}  {}  pid {}  started {}  last seen {}  {}",
            host.id,
            host.hostname,
            host.pid,
            host.started.to_rfc3339(),
            host.last_seen.to_rfc3339(),
            status
        );
    }

    Ok(())
}
