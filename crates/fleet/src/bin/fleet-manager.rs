//! fleet-manager: Hands the initial batch to the controller and starts the engines.
//!
//! Reads `fleet.toml`, uploads its `[[tasks]]` in one request, then spawns
//! one `fleet-engine` per configured name with prefixed output (like
//! docker-compose). Exits when every engine has exited, or stops them all
//! on Ctrl+C / SIGTERM.
//!
//! # Usage
//!
//! ```bash
//! fleet-manager --config config/fleet.toml
//! ```

use std::time::Duration;

use clap::Parser;

use stupid_fleet::{FleetConfig, Manager};

#[derive(Parser, Debug)]
#[command(name = "fleet-manager", version, about)]
struct Cli {
    /// Path to the fleet configuration file.
    #[arg(long, env = "FLEET_CONFIG", default_value = "config/fleet.toml")]
    config: String,

    /// Seconds engines get to exit after SIGTERM before being killed.
    #[arg(long, default_value_t = 5)]
    grace_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = FleetConfig::from_file(&cli.config)?;
    if config.engines.names.is_empty() {
        anyhow::bail!("no engines configured in {}", cli.config);
    }

    let mut manager = Manager::from_config(&config)?;
    tracing::info!(
        engines = manager.engines().len(),
        tasks = manager.pending_tasks().len(),
        controller = %config.controller.endpoint,
        "starting fleet"
    );
    let mut fleet = manager.run().await?;

    let exits = tokio::select! {
        exits = fleet.wait() => Some(exits?),
        _ = shutdown_signal() => None,
    };

    match exits {
        Some(exits) => {
            let failed: Vec<_> = exits.iter().filter(|e| !e.status.success()).collect();
            tracing::info!(engines = exits.len(), failed = failed.len(), "all engines exited");
            if !failed.is_empty() {
                std::process::exit(1);
            }
        }
        None => {
            tracing::info!("shutdown signal received, stopping engines");
            fleet.shutdown(Duration::from_secs(cli.grace_secs)).await;
        }
    }
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable, waiting for Ctrl+C only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
