pub mod client;
pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod launch;
pub mod logbuf;
pub mod manager;
pub mod pool;
pub mod protocol;
pub mod reqrep;
pub mod sync;
pub mod task;
pub mod traits;
pub mod transport;

pub use client::ControllerClient;
pub use config::FleetConfig;
pub use controller::{ControllerServer, FifoController};
pub use engine::{Engine, UploadMark};
pub use error::FleetError;
pub use launch::{run_engine_process, EngineLaunch};
pub use logbuf::{LogBuffer, LogForwardLayer};
pub use manager::{EngineExit, EngineSpec, Fleet, Manager};
pub use pool::TaskPool;
pub use protocol::{AssignedTask, Command, Completion, Envelope, Outcome, StatusReply, StatusReport};
pub use sync::{ExponentialBackoff, Reconnect, ReconnectPolicy, SyncLoop};
pub use task::{SerializedTask, TaskCall, TaskCode, TaskRegistry};
pub use traits::{StatusChannel, StatusHandler};
pub use transport::Transport;
