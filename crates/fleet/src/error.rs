use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while distributing tasks across engines.
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("zeromq error: {0}")]
    Zmq(#[from] zeromq::ZmqError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("no reply from controller after {0:?}")]
    Timeout(Duration),

    /// The manager could not hand its initial batch to the controller.
    #[error("could not connect to controller at {endpoint}: {source}")]
    ControllerUnreachable {
        endpoint: String,
        #[source]
        source: Box<FleetError>,
    },

    #[error("engine '{0}' is already running")]
    AlreadyRunning(String),

    #[error("manager already started; engines and tasks can no longer be added")]
    AlreadyStarted,

    #[error("manager has no engines, call create_engines first")]
    NoEngines,

    #[error("failed to spawn engine process '{name}': {source}")]
    SpawnEngine {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("config error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
