//! Engine process entry point.
//!
//! The manager starts each engine as `fleet-engine --name <name> ...`; the
//! same arguments are parsed back here through [`EngineLaunch`].

use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::client::ControllerClient;
use crate::engine::Engine;
use crate::error::FleetError;
use crate::logbuf::{LogBuffer, LogForwardLayer};
use crate::manager::DEFAULT_ENGINE_SIZE;
use crate::sync::{ExponentialBackoff, SyncLoop};
use crate::task::TaskRegistry;
use crate::transport::Transport;

/// Everything one engine process needs to know.
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct EngineLaunch {
    /// Engine name, reported with every heartbeat.
    #[arg(long)]
    pub name: String,

    /// Pool size, heartbeat loop included.
    #[arg(long, default_value_t = DEFAULT_ENGINE_SIZE)]
    pub size: usize,

    /// Controller endpoint (`tcp://host:port` or `ipc://...`).
    #[arg(long, env = "FLEET_CONTROLLER_ENDPOINT", default_value = "tcp://127.0.0.1:5570")]
    pub controller: String,

    /// Milliseconds between heartbeats.
    #[arg(long, default_value_t = 1000)]
    pub heartbeat_ms: u64,

    /// Milliseconds to wait for a heartbeat reply.
    #[arg(long, default_value_t = 30_000)]
    pub timeout_ms: u64,

    /// Cap on the reconnect delay in milliseconds.
    #[arg(long, default_value_t = 60_000)]
    pub max_delay_ms: u64,

    /// Consecutive failures before an idle engine gives up (0 = never).
    #[arg(long, default_value_t = 30)]
    pub max_failures: u32,
}

impl EngineLaunch {
    /// Command-line form, the inverse of parsing.
    pub fn to_args(&self) -> Vec<String> {
        vec![
            "--name".into(),
            self.name.clone(),
            "--size".into(),
            self.size.to_string(),
            "--controller".into(),
            self.controller.clone(),
            "--heartbeat-ms".into(),
            self.heartbeat_ms.to_string(),
            "--timeout-ms".into(),
            self.timeout_ms.to_string(),
            "--max-delay-ms".into(),
            self.max_delay_ms.to_string(),
            "--max-failures".into(),
            self.max_failures.to_string(),
        ]
    }

    pub fn transport(&self) -> Result<Transport, FleetError> {
        Transport::parse(&self.controller)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial: self.heartbeat(),
            max_delay: Duration::from_millis(self.max_delay_ms),
            max_failures: (self.max_failures > 0).then_some(self.max_failures),
        }
    }

    /// Idle engine with the heartbeat loop as its first pending task.
    pub fn build_engine(&self, registry: Arc<TaskRegistry>, logs: LogBuffer) -> Result<Engine, FleetError> {
        let client = ControllerClient::new(self.transport()?, self.timeout());
        let engine = Engine::with_log_buffer(self.name.clone(), self.size, logs);
        SyncLoop::new(Arc::new(client), registry)
            .interval(self.heartbeat())
            .policy(self.backoff())
            .install(&engine);
        Ok(engine)
    }
}

/// Run one engine until the controller tells it to quit.
///
/// Installs the global tracing subscriber (stderr plus forwarding into the
/// engine's log buffer) and drives the engine on a single-threaded runtime.
pub fn run_engine_process(launch: EngineLaunch, registry: TaskRegistry) -> anyhow::Result<()> {
    let logs = LogBuffer::new();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(LogForwardLayer::new(logs.clone()))
        .init();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let engine = launch.build_engine(Arc::new(registry), logs)?;
        info!(
            engine = %engine.name(),
            size = engine.size(),
            controller = %launch.controller,
            "engine process started"
        );
        engine.run().await?;
        Ok::<_, anyhow::Error>(())
    })
}
