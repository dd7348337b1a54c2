//! Worker process for berth agent sessions.
//!
//! # Lifecycle
//!
//! 1. Parse CLI arguments and load the TOML config
//! 2. Assemble the platform (stores, broker, sandbox stack, session host)
//! 3. Run the sandbox reconciliation sweep once
//! 4. Serve until interrupted

use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use berth_worker::config::WorkerConfig;

/// CLI arguments for the worker process.
#[derive(Parser, Debug)]
#[command(name = "berth-worker", about = "Berth agent session worker")]
struct Args {
    /// Path to the worker TOML configuration.
    #[arg(long, env = "BERTH_CONFIG")]
    config: Option<PathBuf>,

    /// Override the database path from the config file.
    #[arg(long, env = "BERTH_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Skip the startup sandbox reconciliation sweep.
    #[arg(long)]
    no_reconcile: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => WorkerConfig::load(path)?,
        None => WorkerConfig::default(),
    };
    if let Some(db_path) = args.db_path {
        config.db_path = db_path;
    }

    let platform = berth_worker::bootstrap::build(&config).await?;

    if args.no_reconcile {
        info!("skipping sandbox reconciliation sweep");
    } else {
        match platform.reconciler.reconcile().await {
            Ok(report) => info!(
                scanned = report.scanned,
                adopted = report.adopted,
                terminated = report.terminated,
                "startup reconciliation finished"
            ),
            Err(e) => error!(error = %e, "startup reconciliation failed"),
        }
    }

    info!("worker ready");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}
