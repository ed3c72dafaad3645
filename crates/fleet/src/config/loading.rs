use std::path::Path;
use std::time::Duration;

use crate::error::FleetError;
use crate::sync::ExponentialBackoff;
use crate::task::TaskCall;
use crate::transport::Transport;

use super::types::FleetConfig;

impl FleetConfig {
    /// Parse config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, FleetError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, FleetError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    pub fn controller_transport(&self) -> Result<Transport, FleetError> {
        Transport::parse(&self.controller.endpoint)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.controller.timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat.interval_ms)
    }

    /// Reconnect policy for every engine; the first retry waits one heartbeat interval.
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial: self.heartbeat_interval(),
            max_delay: Duration::from_millis(self.reconnect.max_delay_ms),
            max_failures: (self.reconnect.max_failures > 0).then_some(self.reconnect.max_failures),
        }
    }

    pub fn task_calls(&self) -> Vec<TaskCall> {
        self.tasks.iter().map(|t| t.to_call()).collect()
    }

    // ── Environment variable overrides ──────────────────────────────

    /// Apply environment variable overrides.
    ///
    /// - `FLEET_CONTROLLER_ENDPOINT` -> `controller.endpoint`
    /// - `FLEET_CONTROLLER_TIMEOUT_SECS` -> `controller.timeout_secs`
    /// - `FLEET_HEARTBEAT_INTERVAL_MS` -> `heartbeat.interval_ms`
    /// - `FLEET_ENGINE_SIZE` -> `engines.size`
    /// - `FLEET_ENGINE_BINARY` -> `engines.binary`
    ///
    /// Unparsable numbers are ignored.
    pub(crate) fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    pub(crate) fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("FLEET_CONTROLLER_ENDPOINT") {
            self.controller.endpoint = v;
        }
        if let Some(secs) = lookup("FLEET_CONTROLLER_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.controller.timeout_secs = secs;
        }
        if let Some(ms) = lookup("FLEET_HEARTBEAT_INTERVAL_MS").and_then(|v| v.parse().ok()) {
            self.heartbeat.interval_ms = ms;
        }
        if let Some(size) = lookup("FLEET_ENGINE_SIZE").and_then(|v| v.parse().ok()) {
            self.engines.size = size;
        }
        if let Some(v) = lookup("FLEET_ENGINE_BINARY") {
            self.engines.binary = v;
        }
    }
}
