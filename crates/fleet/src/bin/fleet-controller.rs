//! fleet-controller: Development controller handing out tasks first-in first-out.
//!
//! Real deployments bring their own scheduling policy behind `StatusHandler`;
//! this binary is for local runs and demos.
//!
//! # Usage
//!
//! ```bash
//! fleet-controller --endpoint tcp://0.0.0.0:5570
//!
//! # Stop every engine once all queued work has completed
//! fleet-controller --quit-when-drained
//! ```

use std::sync::Arc;

use clap::Parser;
use tokio::sync::Notify;

use stupid_fleet::{ControllerServer, FifoController, Transport};

#[derive(Parser, Debug)]
#[command(name = "fleet-controller", version, about)]
struct Cli {
    /// Endpoint to bind (`tcp://host:port` or `ipc://...`).
    #[arg(long, env = "FLEET_CONTROLLER_ENDPOINT", default_value = "tcp://0.0.0.0:5570")]
    endpoint: String,

    /// Answer "quit" once the queue is empty and nothing is outstanding.
    #[arg(long, env = "FLEET_QUIT_WHEN_DRAINED")]
    quit_when_drained: bool,
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
    let transport = Transport::parse(&cli.endpoint)?;
    let server = ControllerServer::bind(&transport).await?;
    let controller = Arc::new(FifoController::new().quit_when_drained(cli.quit_when_drained));

    let shutdown = Arc::new(Notify::new());
    let notify = Arc::clone(&shutdown);
    tokio::spawn(async move {
        shutdown_signal().await;
        notify.notify_waiters();
    });

    tracing::info!(endpoint = %transport, quit_when_drained = cli.quit_when_drained, "controller listening");
    server.serve(controller.clone(), shutdown).await?;

    let completed = controller.completed();
    let failed = completed.iter().filter(|c| !c.is_success()).count();
    tracing::info!(
        completed = completed.len(),
        failed,
        queued = controller.queued(),
        outstanding = controller.outstanding(),
        "fleet-controller exited"
    );
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
