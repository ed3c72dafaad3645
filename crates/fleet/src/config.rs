//! `fleet.toml`: controller endpoint, heartbeat and reconnect tuning, the
//! engines to spawn and the initial task batch.

mod loading;
mod types;
mod validation;


pub use types::{
    ControllerConfig, EnginesConfig, FleetConfig, HeartbeatConfig, ReconnectConfig, TaskEntry,
};
