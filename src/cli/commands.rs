//! CLI command definitions for eventcast.
//!
//! Thin operator surface over the dispatch subsystem: run one worker,
//! supervise a pool, publish a task, poll for a result, or inspect the
//! broker channels.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use crate::config::Settings;
use crate::envelope::{HintMap, HintValue};
use crate::model::HeuristicModel;
use crate::publisher::TaskPublisher;
use crate::queue::{QueueNames, TaskQueue};
use crate::store::PgFeatureStore;
use crate::supervisor::{SupervisorConfig, WorkerSupervisor};
use crate::worker::{Worker, WorkerConfig};

/// Participation-prediction dispatch for the event platform.
#[derive(Parser)]
#[command(name = "eventcast")]
#[command(about = "Dispatch and process participation-prediction tasks")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run a single worker process consuming prediction tasks.
    Worker(WorkerArgs),

    /// Start and monitor a pool of worker processes.
    Pool(PoolArgs),

    /// Publish one prediction task and print its correlation id.
    Publish(PublishArgs),

    /// Fetch one result from the results channel, if any.
    Poll,
}

/// Arguments for `eventcast worker`.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Unique worker identifier.
    #[arg(long, default_value = "worker-1")]
    pub worker_id: String,

    /// Blocking-claim timeout in seconds.
    #[arg(long, default_value = "1")]
    pub poll_interval: u64,
}

/// Arguments for `eventcast pool`.
#[derive(Parser, Debug)]
pub struct PoolArgs {
    /// Pool subcommand to run.
    #[command(subcommand)]
    pub command: PoolCommand,
}

/// Pool subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum PoolCommand {
    /// Start the worker pool.
    Start(PoolStartArgs),

    /// Check broker reachability and channel depths.
    Status,
}

/// Arguments for `eventcast pool start`.
#[derive(Parser, Debug)]
pub struct PoolStartArgs {
    /// Number of workers to start.
    #[arg(short = 'n', long, default_value = "3")]
    pub workers: usize,

    /// Keep running and restart workers that die.
    #[arg(long)]
    pub monitor: bool,

    /// Liveness check interval in seconds.
    #[arg(long, default_value = "30")]
    pub check_interval: u64,
}

/// Arguments for `eventcast publish`.
#[derive(Parser, Debug)]
pub struct PublishArgs {
    /// Subject user id.
    #[arg(long)]
    pub user_id: i64,

    /// Subject event id.
    #[arg(long)]
    pub event_id: i64,

    /// Feature hints as name=value pairs (bool, number, or text).
    #[arg(long = "hint", value_name = "NAME=VALUE")]
    pub hints: Vec<String>,
}

/// Parses command-line arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Runs the CLI with already-parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let settings = Settings::from_env()?;

    match cli.command {
        Commands::Worker(args) => run_worker(args, &settings).await,
        Commands::Pool(args) => match args.command {
            PoolCommand::Start(args) => run_pool(args, &settings, &cli.log_level).await,
            PoolCommand::Status => run_pool_status(&settings).await,
        },
        Commands::Publish(args) => run_publish(args, &settings).await,
        Commands::Poll => run_poll(&settings).await,
    }
}

async fn run_worker(args: WorkerArgs, settings: &Settings) -> anyhow::Result<()> {
    let database_url = settings
        .database_url
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("DATABASE_URL must be set to run a worker"))?;
    let store = Arc::new(PgFeatureStore::connect(database_url).await?);

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            let _ = shutdown_tx.send(());
        }
    });

    let config = WorkerConfig::new(args.worker_id, settings.broker_url())
        .with_poll_interval(Duration::from_secs(args.poll_interval.max(1)));
    let worker =
        Worker::connect(config, store, Box::new(HeuristicModel::new()), shutdown_rx).await?;
    worker.run().await;
    Ok(())
}

async fn run_pool(args: PoolStartArgs, settings: &Settings, log_level: &str) -> anyhow::Result<()> {
    let config = SupervisorConfig::new(args.workers)
        .with_broker_url(settings.broker_url())
        .with_log_level(log_level)
        .with_check_interval(Duration::from_secs(args.check_interval.max(1)));
    let mut supervisor = WorkerSupervisor::new(config);

    supervisor.start_all().await?;

    for (id, status) in supervisor.status()? {
        info!(worker_id = %id, status = %status, "Pool member");
    }

    if args.monitor {
        tokio::select! {
            result = supervisor.monitor() => result?,
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
            }
        }
    } else {
        info!("Workers started; press Ctrl+C to stop");
        tokio::signal::ctrl_c().await?;
    }

    supervisor.stop_all().await?;
    Ok(())
}

async fn run_pool_status(settings: &Settings) -> anyhow::Result<()> {
    match TaskQueue::connect(&settings.broker_url(), QueueNames::default()).await {
        Ok(queue) => {
            let stats = queue.stats().await?;
            println!("broker: reachable");
            println!(
                "{}: pending={} claimed={} dead-lettered={}",
                stats.tasks_channel, stats.pending, stats.claimed, stats.dead_lettered
            );
            println!(
                "{}: unread results={}",
                stats.results_channel, stats.unread_results
            );
            Ok(())
        }
        Err(e) => {
            println!("broker: unreachable ({e})");
            std::process::exit(1);
        }
    }
}

async fn run_publish(args: PublishArgs, settings: &Settings) -> anyhow::Result<()> {
    let mut hints = HintMap::new();
    for raw in &args.hints {
        let (name, value) = parse_hint(raw)?;
        hints.insert(name, value);
    }

    let mut publisher = TaskPublisher::new(settings.broker_url());
    let correlation_id = publisher.publish(args.user_id, args.event_id, hints).await?;
    println!("{correlation_id}");
    Ok(())
}

async fn run_poll(settings: &Settings) -> anyhow::Result<()> {
    let mut publisher = TaskPublisher::new(settings.broker_url());
    match publisher.poll_result().await? {
        Some(result) => println!("{}", serde_json::to_string_pretty(&result)?),
        None => {
            warn!("No result available");
        }
    }
    Ok(())
}

/// Parses a `name=value` hint, trying bool, then number, then text.
fn parse_hint(raw: &str) -> anyhow::Result<(String, HintValue)> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("hint '{raw}' must be name=value"))?;
    if name.is_empty() {
        anyhow::bail!("hint '{raw}' has an empty name");
    }

    let parsed = if let Ok(flag) = value.parse::<bool>() {
        HintValue::Flag(flag)
    } else if let Ok(number) = value.parse::<f64>() {
        HintValue::Number(number)
    } else {
        HintValue::Text(value.to_string())
    };
    Ok((name.to_string(), parsed))
}
