use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use placesync_core::config::AppConfig;
use placesync_domain::UpdateFlags;

mod app;

#[derive(Parser)]
#[command(name = "placesync", version, about = "Coordination layer for place-record ingestion")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config/placesync.toml")]
    config: String,

    /// Log level when RUST_LOG is not set
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Log output format
    #[arg(long, default_value = "pretty", value_parser = ["pretty", "json"])]
    log_format: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a queue worker until interrupted
    Worker {
        /// Override the configured worker id
        #[arg(long)]
        worker_id: Option<String>,

        /// Override the configured number of processing loops
        #[arg(long)]
        threads: Option<usize>,
    },

    /// Queue inspection and maintenance
    #[command(subcommand)]
    Monitor(MonitorCommand),

    /// Batch run inspection
    #[command(subcommand)]
    Batch(BatchCommand),

    /// Enqueue an update task for one place
    Enqueue {
        place_id: i64,

        #[command(flatten)]
        flags: FlagArgs,

        /// Push to the priority queue instead of the pending queue
        #[arg(long)]
        priority: bool,
    },
}

#[derive(Subcommand)]
enum MonitorCommand {
    /// Print queue depths, counters and the worker registry
    Stats {
        /// Only show workers registered from this host
        #[arg(long)]
        local: bool,
    },

    /// Print the progress record of one task
    Progress { task_id: String },

    /// Requeue everything in the failed set as fresh tasks
    RetryFailed {
        #[command(flatten)]
        flags: FlagArgs,
    },

    /// Evict workers whose heartbeat has gone stale
    Cleanup,
}

#[derive(Subcommand)]
enum BatchCommand {
    /// Print checkpoint progress and the latest execution for a batch
    Status { batch_name: String },
}

/// Which parts of a place to refresh. All three when none is given.
#[derive(Args, Clone, Copy)]
struct FlagArgs {
    #[arg(long)]
    menus: bool,
    #[arg(long)]
    images: bool,
    #[arg(long)]
    reviews: bool,
}

impl FlagArgs {
    fn to_flags(self) -> UpdateFlags {
        if !self.menus && !self.images && !self.reviews {
            return UpdateFlags::all();
        }
        UpdateFlags {
            update_menus: self.menus,
            update_images: self.images,
            update_reviews: self.reviews,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level, &cli.log_format)?;

    let config = AppConfig::load(Some(&cli.config))
        .with_context(|| format!("failed to load configuration from {}", cli.config))?;

    match cli.command {
        Command::Worker { worker_id, threads } => {
            let mut config = config;
            if worker_id.is_some() {
                config.worker.worker_id = worker_id;
            }
            if let Some(threads) = threads {
                config.worker.threads = threads;
            }
            config.validate()?;
            app::run_worker(config).await
        }
        Command::Monitor(command) => match command {
            MonitorCommand::Stats { local } => app::show_stats(config, local).await,
            MonitorCommand::Progress { task_id } => app::show_progress(config, &task_id).await,
            MonitorCommand::RetryFailed { flags } => {
                app::retry_failed(config, flags.to_flags()).await
            }
            MonitorCommand::Cleanup => app::cleanup_workers(config).await,
        },
        Command::Batch(BatchCommand::Status { batch_name }) => {
            app::show_batch_status(config, &batch_name).await
        }
        Command::Enqueue {
            place_id,
            flags,
            priority,
        } => app::enqueue(config, place_id, flags.to_flags(), priority).await,
    }
}

fn init_logging(log_level: &str, log_format: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format {
        "json" => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .context("failed to initialize json logging")?,
        _ => registry
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .context("failed to initialize logging")?,
    }
    Ok(())
}
