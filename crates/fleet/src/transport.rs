use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::FleetError;

/// Where the controller listens and engines connect.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "address")]
pub enum Transport {
    /// Unix domain socket under `/tmp/stupid-fleet/`, for single-host fleets.
    Ipc(String),

    /// TCP, for engines on other hosts.
    Tcp { host: String, port: u16 },
}

impl Transport {
    pub fn ipc(name: &str) -> Self {
        Self::Ipc(name.to_string())
    }

    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    /// Parse `tcp://host:port` or `ipc:///tmp/stupid-fleet/<name>.sock`.
    ///
    /// IPC endpoints keep only the file stem; the socket directory is fixed.
    pub fn parse(endpoint: &str) -> Result<Self, FleetError> {
        if let Some(path) = endpoint.strip_prefix("ipc://") {
            let name = Path::new(path)
                .file_stem()
                .and_then(|s| s.to_str())
                .filter(|s| !s.is_empty())
                .ok_or_else(|| FleetError::Config(format!("ipc endpoint has no name: {endpoint}")))?;
            return Ok(Self::ipc(name));
        }

        if let Some(addr) = endpoint.strip_prefix("tcp://") {
            let (host, port) = addr.rsplit_once(':').ok_or_else(|| {
                FleetError::Config(format!("tcp endpoint is missing a port: {endpoint}"))
            })?;
            let port = port
                .parse::<u16>()
                .map_err(|e| FleetError::Config(format!("bad port in '{endpoint}': {e}")))?;
            if host.is_empty() {
                return Err(FleetError::Config(format!(
                    "tcp endpoint is missing a host: {endpoint}"
                )));
            }
            return Ok(Self::tcp(host, port));
        }

        Err(FleetError::Config(format!(
            "unsupported endpoint '{endpoint}', expected tcp:// or ipc://"
        )))
    }

    /// ZeroMQ endpoint string.
    pub fn endpoint(&self) -> String {
        match self {
            Self::Ipc(name) => format!("ipc:///tmp/stupid-fleet/{name}.sock"),
            Self::Tcp { host, port } => format!("tcp://{host}:{port}"),
        }
    }

    /// Create the socket directory for IPC endpoints. No-op for TCP.
    pub fn ensure_ipc_dir(&self) -> std::io::Result<()> {
        if let Some(path) = self.ipc_path() {
            if let Some(parent) = Path::new(&path).parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }

    /// Remove a socket file left behind by a controller that did not exit cleanly.
    pub fn remove_stale_socket(&self) -> std::io::Result<()> {
        if let Some(path) = self.ipc_path() {
            match std::fs::remove_file(&path) {
                Ok(()) => tracing::debug!(path, "removed stale IPC socket"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn ipc_path(&self) -> Option<String> {
        match self {
            Self::Ipc(_) => {
                let endpoint = self.endpoint();
                Some(endpoint.trim_start_matches("ipc://").to_string())
            }
            Self::Tcp { .. } => None,
        }
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.endpoint())
    }
}
