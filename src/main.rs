//! ciwatch - CI job telemetry sidecar
//!
//! `start` and `finish` bracket a CI job and always exit successfully, so a
//! telemetry problem never fails the job. `daemon` is the long-running
//! sampler that `start` launches in the background.

use anyhow::Result;
use ciwatch::{
    cli::{Cli, Command},
    config::Config,
    daemon::Daemon,
    orchestrator::Orchestrator,
};
use clap::Parser;
use std::io::IsTerminal;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(std::io::stdout().is_terminal())
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration by layering sources: defaults, file, environment, and CLI args.
    let config = match Config::load(&cli) {
        Ok(config) => config,
        Err(err) => {
            init_logging("info");
            error!("Failed to load configuration: {:#}", err);
            if matches!(cli.command, Command::Daemon { .. }) {
                return Err(err);
            }
            return Ok(());
        }
    };
    init_logging(&config.log_level);

    match cli.command {
        Command::Daemon { port } => run_daemon(config, port).await,
        Command::Start => {
            info!("ciwatch starting ...");
            match Orchestrator::new(config).start().await {
                Ok(report) => info!(port = report.port, tracer = ?report.tracer, "ciwatch started"),
                Err(e) => error!("ciwatch failed to start: {:#}", e),
            }
            Ok(())
        }
        Command::Finish => {
            info!("ciwatch finishing ...");
            match Orchestrator::new(config).finish().await {
                Ok(report) => info!(
                    metrics = report.metric_count,
                    processes = report.process_count,
                    job_id = ?report.job.id,
                    "ciwatch finished"
                ),
                Err(e) => error!("ciwatch failed to finish: {:#}", e),
            }
            Ok(())
        }
    }
}

async fn run_daemon(config: Config, port: u16) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let daemon = Daemon::builder(config).port(port).build(shutdown_rx).await?;

    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("Shutdown signal received. Shutting down gracefully...");
        let _ = shutdown_tx.send(true);
    });

    daemon.run().await
}

/// Resolves on SIGINT or SIGTERM.
async fn wait_for_shutdown_signal() {
    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "Unable to listen for SIGTERM, waiting for SIGINT only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}
