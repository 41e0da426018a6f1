//! CLI command definitions for grid-broker.

use std::sync::Arc;

use chrono::Utc;
use clap::Parser;
use serde::Serialize;
use tracing::info;

use crate::config::SchedulerConfig;
use crate::context::SchedulerContext;
use crate::liveness::LivenessMonitor;
use crate::metrics::init_metrics;
use crate::priority::PriorityEngine;
use crate::scheduler::Command;
use crate::storage::{PgTaskQueueStore, PriorityScope, TaskQueueStore};

use super::serve::run_serve;

/// Grid job broker.
#[derive(Parser)]
#[command(name = "grid-broker")]
#[command(about = "Match grid agents to queued jobs, keep fair-share priorities and reclaim lost jobs")]
#[command(version)]
#[command(
    long_about = "grid-broker serves job-match requests from compute-site agents against a shared task queue.\n\nConfiguration is read from DATABASE_URL and BROKER_* environment variables.\n\nExample usage:\n  grid-broker migrate\n  grid-broker serve\n  grid-broker sweep --json"
)]
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
    /// Run the broker: command workers, liveness sweep and priority batch.
    Serve(ServeArgs),

    /// Apply pending database migrations.
    Migrate,

    /// Run one liveness sweep.
    Sweep(SweepArgs),

    /// Show the per-user priority table.
    Priorities(PriorityArgs),

    /// Recompute userload and computed priority for every user.
    #[command(name = "priority-calc")]
    PriorityCalc(PriorityArgs),

    /// Block or unblock a CE's queue.
    #[command(name = "block-queue")]
    BlockQueue(BlockQueueArgs),

    /// Run a single front-door command given as JSON.
    Dispatch(DispatchArgs),
}

#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Do not read commands from stdin.
    #[arg(long)]
    pub no_front_door: bool,
}

#[derive(Parser, Debug)]
pub struct SweepArgs {
    /// Sweep even if another instance swept within the interval.
    #[arg(long)]
    pub force: bool,

    /// Print the report as JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct PriorityArgs {
    /// Include users without running jobs or recent usage.
    #[arg(long)]
    pub all: bool,

    /// Print as JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct BlockQueueArgs {
    /// CE whose queue to change.
    #[arg(long)]
    pub ce: String,

    /// Unblock instead of block.
    #[arg(long)]
    pub unblock: bool,
}

#[derive(Parser, Debug)]
pub struct DispatchArgs {
    /// Command object, e.g. '{"command":"get_jobs","queue_ids":[42]}'.
    pub command: String,
}

impl PriorityArgs {
    fn scope(&self) -> PriorityScope {
        if self.all {
            PriorityScope::All
        } else {
            PriorityScope::ActiveOnly
        }
    }
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
///
/// For more control over logging initialization, use `parse_cli()` and `run_with_cli()`.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = SchedulerConfig::from_env()?;

    if let Err(e) = init_metrics() {
        tracing::warn!(error = %e, "Failed to initialize metrics");
    }

    match cli.command {
        Commands::Serve(args) => {
            let context = SchedulerContext::connect(config).await?;
            run_serve(context, !args.no_front_door).await?;
        }
        Commands::Migrate => run_migrate_command(&config).await?,
        Commands::Sweep(args) => run_sweep_command(&config, args).await?,
        Commands::Priorities(args) => run_priorities_command(&config, args).await?,
        Commands::PriorityCalc(args) => run_priority_calc_command(&config, args).await?,
        Commands::BlockQueue(args) => run_block_queue_command(&config, args).await?,
        Commands::Dispatch(args) => run_dispatch_command(config, args).await?,
    }

    Ok(())
}

/// Store-only commands do not need the token service or site directory.
async fn connect_store(config: &SchedulerConfig) -> anyhow::Result<Arc<PgTaskQueueStore>> {
    let store = PgTaskQueueStore::connect(
        &config.database_url,
        config.max_connections,
        config.store_timeouts(),
    )
    .await?;
    Ok(Arc::new(store))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| anyhow::anyhow!("Failed to serialize output: {}", e))?;
    println!("{}", json);
    Ok(())
}

async fn run_migrate_command(config: &SchedulerConfig) -> anyhow::Result<()> {
    let store = connect_store(config).await?;
    let applied = store.run_migrations().await?;
    info!(applied = applied.len(), "Migrations complete");

    for migration in store.applied_migrations().await? {
        let marker = if applied.iter().any(|name| *name == migration.name) { "new" } else { "   " };
        println!("{} {}  {}", marker, migration.name, migration.applied_at.to_rfc3339());
    }
    println!("Applied {} migration(s)", applied.len());
    Ok(())
}

async fn run_sweep_command(config: &SchedulerConfig, args: SweepArgs) -> anyhow::Result<()> {
    let store = connect_store(config).await?;
    let monitor = LivenessMonitor::new(store, config.liveness_settings(), config.instance.clone());

    let report = if args.force {
        monitor.sweep(Utc::now()).await?
    } else {
        monitor.run_cycle().await?
    };

    if args.json {
        print_json(&report)?;
    } else {
        println!("Liveness sweep: {} job(s) moved", report.moved());
    }
    Ok(())
}

async fn run_priorities_command(config: &SchedulerConfig, args: PriorityArgs) -> anyhow::Result<()> {
    let store = connect_store(config).await?;
    let records = store.priority_records(args.scope()).await?;

    if args.json {
        return print_json(&records);
    }

    println!(
        "{:<20} {:>10} {:>8} {:>10} {:>10} {:>12}",
        "USER", "PRIORITY", "RUNNING", "MAX", "USERLOAD", "COMPUTED"
    );
    for record in &records {
        println!(
            "{:<20} {:>10.2} {:>8} {:>10} {:>10.3} {:>12.2}",
            record.user,
            record.priority,
            record.running,
            record.max_parallel_jobs,
            record.userload,
            record.computed_priority
        );
    }
    Ok(())
}

async fn run_priority_calc_command(config: &SchedulerConfig, args: PriorityArgs) -> anyhow::Result<()> {
    let store = connect_store(config).await?;
    let engine = PriorityEngine::new(store);
    let report = engine.run_batch(args.scope()).await?;

    if args.json {
        print_json(&report)?;
    } else {
        println!(
            "Updated {} of {} user(s), {} failed, {} over quota",
            report.updated, report.rows, report.failed, report.quota_exceeded
        );
    }
    Ok(())
}

async fn run_block_queue_command(config: &SchedulerConfig, args: BlockQueueArgs) -> anyhow::Result<()> {
    let store = connect_store(config).await?;
    let blocked = !args.unblock;
    store.set_site_queue_blocked(&args.ce, blocked).await?;

    info!(ce = %args.ce, blocked = blocked, "Site queue updated");
    println!(
        "Queue of {} is now {}",
        args.ce,
        if blocked { "blocked" } else { "open" }
    );
    Ok(())
}

async fn run_dispatch_command(config: SchedulerConfig, args: DispatchArgs) -> anyhow::Result<()> {
    let command: Command = serde_json::from_str(&args.command)
        .map_err(|e| anyhow::anyhow!("Invalid command JSON: {}", e))?;

    let context = SchedulerContext::connect(config).await?;
    let response = context.dispatcher().dispatch(command).await?;
    print_json(&response)
}
