//! Registration Reconciliation Daemon
//!
//! Main entry point for regsyncd. Connects to the local switch's
//! management channel, reconciles observed client presence into outbound
//! registrations on the remote peer, and serves a read-only status
//! endpoint for the dashboard.

use anyhow::Context;
use clap::Parser;
use regsyncd::config::RegsyncConfig;
use regsyncd::metrics::MetricsCollector;
use regsyncd::status::{StatusState, spawn_status_server};
use regsyncd::supervisor::Supervisor;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Dynamic DN registration reconciliation daemon
#[derive(Debug, Parser)]
#[command(name = "regsyncd", version, about)]
struct Cli {
    /// Path to a TOML configuration file; environment variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn init_logging(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.to_lowercase()))
        .context("invalid log level")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .compact()
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to set logger: {}", e))?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = RegsyncConfig::load(cli.config.as_deref()).context("loading configuration")?;
    init_logging(&config.log_level)?;

    info!("regsyncd: Starting registration reconciliation daemon");
    info!(
        ami = format!("{}:{}", config.asterisk.host, config.asterisk.ami_port),
        genesys = format!("{}:{}", config.genesys.host, config.genesys.port),
        dns = %config.scope(),
        "Effective configuration"
    );

    let metrics = MetricsCollector::new().context("creating metrics collector")?;
    let mut supervisor = Supervisor::new(config.clone(), metrics.clone());

    if config.status.enabled {
        let state = Arc::new(StatusState {
            ledger: supervisor.ledger_handle(),
            metrics: metrics.clone(),
            scope: config.scope().to_string(),
            started_at: chrono::Utc::now(),
        });
        let addr = config.status_bind().context("status bind address")?;
        spawn_status_server(addr, state);
    }

    // Explicit cancellation instead of detached signal-handler cleanup:
    // the sweep runs inside the supervisor before main returns.
    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("regsyncd: Received shutdown signal");
            signal_token.cancel();
        }
    });

    let result = supervisor.run(token).await;
    match &result {
        Ok(()) => info!("regsyncd: Daemon exiting normally"),
        Err(e) => warn!(error = %e, "regsyncd: Daemon exiting with error"),
    }
    result.context("supervisor loop")
}
