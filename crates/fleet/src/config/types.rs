use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::manager::DEFAULT_ENGINE_SIZE;
use crate::task::TaskCall;

// ── Top-level config ────────────────────────────────────────────────

/// Full configuration of a fleet.
///
/// Parsed from `fleet.toml` with environment variable overrides applied on top.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetConfig {
    #[serde(default)]
    pub controller: ControllerConfig,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    #[serde(default)]
    pub engines: EnginesConfig,

    /// Initial batch, handed to the controller before any engine starts.
    #[serde(default)]
    pub tasks: Vec<TaskEntry>,
}

// ── Section configs ─────────────────────────────────────────────────

/// Where the controller listens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// `tcp://host:port` or `ipc:///tmp/stupid-fleet/<name>.sock`.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Seconds to wait for a heartbeat reply.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_endpoint() -> String {
    "tcp://127.0.0.1:5570".into()
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

fn default_interval_ms() -> u64 {
    1000
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
        }
    }
}

/// Backoff applied while the controller is unreachable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Upper bound on the delay between attempts.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Consecutive failures after which an idle engine gives up. 0 = never.
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_max_failures() -> u32 {
    30
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_delay_ms: default_max_delay_ms(),
            max_failures: default_max_failures(),
        }
    }
}

/// Engine processes spawned by the manager, one per name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnginesConfig {
    #[serde(default)]
    pub names: Vec<String>,

    /// Pool size of every engine, heartbeat loop included.
    #[serde(default = "default_size")]
    pub size: usize,

    /// Engine executable. Bare names are looked up next to the manager
    /// binary first, then on `PATH`.
    #[serde(default = "default_binary")]
    pub binary: String,
}

fn default_size() -> usize {
    DEFAULT_ENGINE_SIZE
}

fn default_binary() -> String {
    "fleet-engine".into()
}

impl Default for EnginesConfig {
    fn default() -> Self {
        Self {
            names: Vec::new(),
            size: default_size(),
            binary: default_binary(),
        }
    }
}

/// One `[[tasks]]` entry: a registered target and its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEntry {
    pub target: String,

    #[serde(default)]
    pub args: Vec<Value>,
}

impl TaskEntry {
    pub fn to_call(&self) -> TaskCall {
        TaskCall::call(self.target.clone(), self.args.clone())
    }
}
