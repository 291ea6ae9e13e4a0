//! Mission driver: load configuration, wire the control plane to the
//! configured planner and worker commands, run one mission, and map the
//! stop reason to a process exit code.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use control_plane::{
    CommandPlanner, ContinuousController, LocalProcessBackend, MissionConfig, MissionOutcome,
};

/// Exit code for internal errors, past the reserved stop-reason codes.
const EXIT_INTERNAL: u8 = 70;

#[derive(Parser, Debug)]
#[command(name = "mission-driver", about = "Autonomous development mission driver")]
struct Cli {
    /// Path to the mission TOML configuration.
    #[arg(short, long, default_value = "mission.toml")]
    config: PathBuf,

    /// Natural-language objective for this mission.
    #[arg(short, long)]
    objective: String,

    /// Override the configured worker concurrency.
    #[arg(long)]
    workers: Option<usize>,

    /// Override the configured mission budget in dollars.
    #[arg(long)]
    budget_usd: Option<f64>,

    /// Override the configured wall-time budget in seconds.
    #[arg(long)]
    wall_time: Option<u64>,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> Result<MissionOutcome> {
    let mut config = MissionConfig::load(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;

    if let Some(workers) = cli.workers {
        config.scheduler.parallel.num_workers = workers;
    }
    if let Some(budget) = cli.budget_usd {
        config.scheduler.budget.max_per_run_usd = budget;
    }
    if let Some(wall) = cli.wall_time {
        config.continuous.max_wall_time_seconds = wall;
    }

    if config.worker.command.trim().is_empty() {
        anyhow::bail!("worker.command is not configured");
    }
    if config.planner.command.trim().is_empty() {
        anyhow::bail!("planner.command is not configured");
    }

    let planner = Box::new(CommandPlanner::new(
        config.planner.command.clone(),
        Duration::from_secs(config.planner.timeout),
    ));
    let backend = Arc::new(LocalProcessBackend::new(config.worker.command.clone()));

    info!(
        target = %config.target.path.display(),
        workers = config.scheduler.parallel.num_workers,
        budget = config.scheduler.budget.max_per_run_usd,
        "starting mission"
    );

    let mut controller = ContinuousController::bootstrap(config, planner, backend)
        .await
        .context("bootstrapping the control plane")?;
    let outcome = controller
        .run(&cli.objective)
        .await
        .context("running the mission")?;

    info!(
        mission_id = %outcome.mission_id,
        reason = %outcome.stop_reason,
        epochs = outcome.epochs_run,
        cost = outcome.total_cost_usd,
        "mission ended"
    );
    Ok(outcome)
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(outcome) => ExitCode::from(outcome.exit_code.clamp(0, u8::MAX as i32) as u8),
        Err(e) => {
            error!(error = ?e, "mission driver failed");
            ExitCode::from(EXIT_INTERNAL)
        }
    }
}
