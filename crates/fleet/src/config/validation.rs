use std::collections::HashSet;

use super::types::FleetConfig;
use crate::error::FleetError;

impl FleetConfig {
    /// Validate the config: endpoint syntax, engine sizing and naming, timings.
    pub fn validate(&self) -> Result<(), FleetError> {
        self.controller_transport()?;
        self.validate_engines()?;
        self.validate_timings()?;
        Ok(())
    }

    /// The heartbeat loop holds one slot, so an engine needs at least two.
    fn validate_engines(&self) -> Result<(), FleetError> {
        if self.engines.size < 2 {
            return Err(FleetError::Config(format!(
                "engines.size must be at least 2, got {}",
                self.engines.size
            )));
        }
        let mut seen = HashSet::new();
        for name in &self.engines.names {
            if name.trim().is_empty() {
                return Err(FleetError::Config("engine names must not be empty".into()));
            }
            if !seen.insert(name.as_str()) {
                return Err(FleetError::Config(format!("duplicate engine name '{name}'")));
            }
        }
        Ok(())
    }

    fn validate_timings(&self) -> Result<(), FleetError> {
        if self.heartbeat.interval_ms == 0 {
            return Err(FleetError::Config("heartbeat.interval_ms must be non-zero".into()));
        }
        if self.controller.timeout_secs == 0 {
            return Err(FleetError::Config("controller.timeout_secs must be non-zero".into()));
        }
        Ok(())
    }
}
