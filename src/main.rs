// ABOUTME: Entry point for the beacon binary.
// ABOUTME: Runs a demo workload under a status beacon, or prints the status file a beacon wrote.

use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use anyhow::{Context, bail};
use beacon_poller::{Beacon, BeaconConfig};
use beacon_store::StatusSnapshot;
use clap::{Parser, Subcommand};

const DEFAULT_LOG_FILTER: &str = "beacon=info,beacon_core=info,beacon_store=info,beacon_poller=info";

#[derive(Parser)]
#[command(name = "beacon", version, about = "Single-row SQLite status beacon")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a demo workload while a beacon records its progress.
    Run {
        /// Status file to write (default: BEACON_PATH or status.db).
        statusfile: Option<PathBuf>,

        /// Seconds between two status updates.
        #[arg(long)]
        interval: Option<f64>,

        /// Consecutive failures tolerated before the beacon gives up.
        #[arg(long)]
        max_errors: Option<u32>,

        /// Number of workload steps.
        #[arg(long, default_value_t = 60)]
        ticks: u32,

        /// Milliseconds spent on each workload step.
        #[arg(long, default_value_t = 10)]
        tick_ms: u64,

        /// Make the workload fail at this step.
        #[arg(long)]
        fail_at: Option<u32>,
    },

    /// Print the latest status recorded in a status file as JSON.
    Inspect {
        statusfile: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            statusfile,
            interval,
            max_errors,
            ticks,
            tick_ms,
            fail_at,
        } => {
            let mut config = match statusfile {
                Some(path) => BeaconConfig::new(path)?,
                None => BeaconConfig::from_env()?,
            };
            if let Some(secs) = interval {
                config = config.with_interval_secs(secs)?;
            }
            if let Some(max_errors) = max_errors {
                config = config.with_max_errors(max_errors)?;
            }
            run(config, ticks, Duration::from_millis(tick_ms), fail_at).await
        }
        Commands::Inspect { statusfile } => inspect(&statusfile),
    }
}

async fn run(
    config: BeaconConfig,
    ticks: u32,
    step: Duration,
    fail_at: Option<u32>,
) -> anyhow::Result<()> {
    let current = Arc::new(AtomicI64::new(0));

    let mut beacon = Beacon::new(config);
    let probe = Arc::clone(&current);
    beacon.add_updatable("current", move || {
        Ok::<_, Infallible>(probe.load(Ordering::SeqCst))
    })?;
    beacon.add_static("fortytwo", 42)?;
    beacon.add_static("ticks", ticks)?;
    beacon.finalize_and_start()?;

    tracing::info!(path = %beacon.config().path.display(), ticks, "starting main loop");
    let result = workload(&current, ticks, step, fail_at).await;

    let outcome = beacon.shutdown_async().await?;
    tracing::info!(?outcome, "status beacon stopped");
    result
}

async fn workload(
    current: &AtomicI64,
    ticks: u32,
    step: Duration,
    fail_at: Option<u32>,
) -> anyhow::Result<()> {
    for i in 1..=ticks {
        if fail_at == Some(i) {
            bail!("workload failed at step {i}");
        }
        current.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(step).await;
    }
    Ok(())
}

fn inspect(statusfile: &Path) -> anyhow::Result<()> {
    let snapshot = StatusSnapshot::read(statusfile)
        .with_context(|| format!("reading status file {}", statusfile.display()))?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}
