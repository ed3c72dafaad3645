//! Fleet orchestration.
//!
//! The [`Manager`] collects engine definitions and the initial task batch,
//! hands the whole batch to the controller in one upload, then starts one
//! OS process per engine. Each process builds its own [`Engine`] with the
//! heartbeat loop as the first pending task (see [`crate::launch`]).
//!
//! [`Engine`]: crate::engine::Engine

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::client::{ControllerClient, DEFAULT_TIMEOUT};
use crate::config::FleetConfig;
use crate::error::FleetError;
use crate::launch::EngineLaunch;
use crate::protocol::StatusReport;
use crate::sync::{ExponentialBackoff, DEFAULT_INTERVAL};
use crate::task::TaskCall;
use crate::traits::StatusChannel;
use crate::transport::Transport;

/// Default pool size of a created engine.
pub const DEFAULT_ENGINE_SIZE: usize = 50;

/// A named engine to be started by [`Manager::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSpec {
    pub name: String,
    pub size: usize,
}

pub struct Manager {
    controller: Transport,
    timeout: Duration,
    heartbeat: Duration,
    backoff: ExponentialBackoff,
    engine_program: PathBuf,
    engines: Vec<EngineSpec>,
    tasks: Vec<TaskCall>,
    started: bool,
}

impl Manager {
    pub fn new(controller: Transport) -> Self {
        Self {
            controller,
            timeout: DEFAULT_TIMEOUT,
            heartbeat: DEFAULT_INTERVAL,
            backoff: ExponentialBackoff::default(),
            engine_program: resolve_program("fleet-engine"),
            engines: Vec::new(),
            tasks: Vec::new(),
            started: false,
        }
    }

    /// Manager with engines and the initial batch taken from `config`.
    pub fn from_config(config: &FleetConfig) -> Result<Self, FleetError> {
        let mut manager = Self::new(config.controller_transport()?)
            .timeout(config.timeout())
            .heartbeat(config.heartbeat_interval())
            .backoff(config.backoff())
            .engine_program(resolve_program(&config.engines.binary));
        manager.create_engines(&config.engines.names, config.engines.size)?;
        for call in config.task_calls() {
            manager.add_task(call)?;
        }
        Ok(manager)
    }

    /// RPC timeout for the bootstrap upload and every engine heartbeat.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat = interval;
        self
    }

    pub fn backoff(mut self, backoff: ExponentialBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Executable started once per engine.
    pub fn engine_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.engine_program = program.into();
        self
    }

    /// Define one engine of `size` slots per name.
    ///
    /// The heartbeat loop permanently takes one slot, so `size` must be at
    /// least 2. Names must be unique across the fleet.
    pub fn create_engines<S: AsRef<str>>(&mut self, names: &[S], size: usize) -> Result<(), FleetError> {
        self.ensure_not_started()?;
        if size < 2 {
            return Err(FleetError::Config(format!(
                "engine size must be at least 2, got {size}"
            )));
        }

        let mut taken: HashSet<&str> = self.engines.iter().map(|e| e.name.as_str()).collect();
        for name in names {
            let name = name.as_ref();
            if name.is_empty() || !taken.insert(name) {
                return Err(FleetError::Config(format!("invalid or duplicate engine name '{name}'")));
            }
        }

        self.engines.extend(names.iter().map(|name| EngineSpec {
            name: name.as_ref().to_string(),
            size,
        }));
        Ok(())
    }

    /// Add a task to the initial batch.
    pub fn add_task(&mut self, call: TaskCall) -> Result<(), FleetError> {
        self.ensure_not_started()?;
        self.tasks.push(call);
        Ok(())
    }

    /// Add one `target` call per argument group to the initial batch.
    pub fn add_tasks<I>(&mut self, target: &str, groups: I) -> Result<(), FleetError>
    where
        I: IntoIterator<Item = Vec<Value>>,
    {
        self.ensure_not_started()?;
        self.tasks
            .extend(groups.into_iter().map(|args| TaskCall::call(target, args)));
        Ok(())
    }

    pub fn engines(&self) -> &[EngineSpec] {
        &self.engines
    }

    /// Initial batch not yet handed to the controller.
    pub fn pending_tasks(&self) -> &[TaskCall] {
        &self.tasks
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Hand the initial batch to the controller, then start every engine process.
    ///
    /// Fails with [`FleetError::NoEngines`] before any engine was created and
    /// with [`FleetError::ControllerUnreachable`] if the upload fails; the
    /// batch is kept in that case and nothing is spawned.
    pub async fn run(&mut self) -> Result<Fleet, FleetError> {
        if self.engines.is_empty() {
            return Err(FleetError::NoEngines);
        }
        self.ensure_not_started()?;

        self.upload_batch().await?;
        self.started = true;

        let width = self.engines.iter().map(|e| e.name.len()).max().unwrap_or(0);
        let mut fleet = Fleet {
            children: Vec::with_capacity(self.engines.len()),
        };
        for (idx, spec) in self.engines.iter().enumerate() {
            let child = self.spawn_engine(spec, COLORS[idx % COLORS.len()], width)?;
            fleet.children.push(child);
        }
        info!(engines = fleet.len(), "all engines started");
        Ok(fleet)
    }

    async fn upload_batch(&mut self) -> Result<(), FleetError> {
        let tasks = self
            .tasks
            .iter()
            .map(TaskCall::encode)
            .collect::<Result<Vec<_>, _>>()?;
        let count = tasks.len();

        let endpoint = self.controller.to_string();
        let unreachable = |source: FleetError| FleetError::ControllerUnreachable {
            endpoint: endpoint.clone(),
            source: Box::new(source),
        };

        let client = ControllerClient::connect(self.controller.clone(), self.timeout)
            .await
            .map_err(unreachable)?;
        client
            .send_status(&StatusReport::bootstrap(tasks))
            .await
            .map_err(unreachable)?;

        info!(endpoint = %self.controller, tasks = count, "initial batch handed to controller");
        self.tasks.clear();
        Ok(())
    }

    /// Arguments the engine process for `spec` is started with.
    fn launch_for(&self, spec: &EngineSpec) -> EngineLaunch {
        EngineLaunch {
            name: spec.name.clone(),
            size: spec.size,
            controller: self.controller.endpoint(),
            heartbeat_ms: self.heartbeat.as_millis() as u64,
            timeout_ms: self.timeout.as_millis() as u64,
            max_delay_ms: self.backoff.max_delay.as_millis() as u64,
            max_failures: self.backoff.max_failures.unwrap_or(0),
        }
    }

    fn spawn_engine(&self, spec: &EngineSpec, color: &str, width: usize) -> Result<EngineChild, FleetError> {
        let launch = self.launch_for(spec);

        let mut cmd = Command::new(&self.engine_program);
        cmd.args(launch.to_args())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| FleetError::SpawnEngine {
            name: spec.name.clone(),
            source,
        })?;
        info!(engine = %spec.name, pid = ?child.id(), program = %self.engine_program.display(), "engine spawned");

        let prefix = format!("{color}{:>width$}{RESET} │ ", spec.name);
        if let Some(stdout) = child.stdout.take() {
            let prefix = prefix.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    println!("{prefix}{line}");
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    eprintln!("{prefix}{line}");
                }
            });
        }

        Ok(EngineChild {
            name: spec.name.clone(),
            child,
        })
    }

    fn ensure_not_started(&self) -> Result<(), FleetError> {
        if self.started {
            Err(FleetError::AlreadyStarted)
        } else {
            Ok(())
        }
    }
}

/// Bare program names resolve next to the running executable when a file
/// of that name exists there, otherwise through `PATH`.
fn resolve_program(binary: &str) -> PathBuf {
    let path = Path::new(binary);
    if path.components().count() > 1 {
        return path.to_path_buf();
    }
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(binary)))
        .filter(|candidate| candidate.is_file())
        .unwrap_or_else(|| path.to_path_buf())
}

// ── Spawned engines ──────────────────────────────────────────────────

const COLORS: &[&str] = &[
    "\x1b[36m", // cyan
    "\x1b[33m", // yellow
    "\x1b[32m", // green
    "\x1b[35m", // magenta
    "\x1b[34m", // blue
];
const RESET: &str = "\x1b[0m";

#[derive(Debug)]
struct EngineChild {
    name: String,
    child: Child,
}

/// How one engine process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineExit {
    pub name: String,
    pub status: ExitStatus,
}

/// The running engine processes. Dropping it kills them.
#[derive(Debug)]
pub struct Fleet {
    children: Vec<EngineChild>,
}

impl Fleet {
    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.children.iter().map(|c| c.name.as_str()).collect()
    }

    /// Wait until every engine process has exited.
    pub async fn wait(&mut self) -> Result<Vec<EngineExit>, FleetError> {
        let mut exits = Vec::with_capacity(self.children.len());
        for managed in &mut self.children {
            let status = managed.child.wait().await?;
            if status.success() {
                info!(engine = %managed.name, "engine exited");
            } else {
                warn!(engine = %managed.name, %status, "engine exited abnormally");
            }
            exits.push(EngineExit {
                name: managed.name.clone(),
                status,
            });
        }
        Ok(exits)
    }

    /// Ask every engine to terminate, force-killing whatever is still alive after `grace`.
    pub async fn shutdown(&mut self, grace: Duration) {
        for managed in &mut self.children {
            let Some(pid) = managed.child.id() else {
                continue;
            };
            #[cfg(unix)]
            {
                let _ = std::process::Command::new("kill")
                    .args(["-TERM", &pid.to_string()])
                    .output();
                info!(engine = %managed.name, pid, "sent SIGTERM");
            }
            #[cfg(not(unix))]
            {
                let _ = managed.child.start_kill();
                info!(engine = %managed.name, pid, "sent kill signal");
            }
        }

        let deadline = tokio::time::sleep(grace);
        tokio::pin!(deadline);

        loop {
            let all_exited = self
                .children
                .iter_mut()
                .all(|m| m.child.try_wait().ok().flatten().is_some());
            if all_exited {
                info!("all engines exited");
                return;
            }

            tokio::select! {
                _ = &mut deadline => {
                    warn!("graceful shutdown timed out, force killing remaining engines");
                    for managed in &mut self.children {
                        if managed.child.try_wait().ok().flatten().is_none() {
                            let _ = managed.child.kill().await;
                            warn!(engine = %managed.name, "force killed");
                        }
                    }
                    return;
                }
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            }
        }
    }
}
