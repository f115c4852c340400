//! Worker process environment contract.
//!
//! The supervisor sets these variables at spawn time; the worker fails fast
//! with a descriptive error if any of them is absent or empty.

use crate::error::{FleetError, FleetResult};
use serde_json::Value;
use std::path::PathBuf;

/// Unique device identifier.
pub const ENV_DEVICE_ID: &str = "FLEET_DEVICE_ID";
/// Namespace the fleet runs under.
pub const ENV_NAMESPACE: &str = "FLEET_NAMESPACE";
/// Project the fleet runs under.
pub const ENV_PROJECT: &str = "FLEET_PROJECT";
/// Spool directory of the filesystem bus.
pub const ENV_BUS_DIR: &str = "FLEET_BUS_DIR";
/// Serialized board-configuration blob (JSON).
pub const ENV_BOARD_CONFIG: &str = "FLEET_BOARD_CONFIG";

/// Everything a worker needs to know, as handed down by its supervisor.
#[derive(Debug, Clone)]
pub struct WorkerEnv {
    /// Device id this worker serves.
    pub device_id: String,
    /// Namespace identifier (informational).
    pub namespace: String,
    /// Project identifier (informational).
    pub project: String,
    /// Bus spool directory.
    pub bus_dir: PathBuf,
    /// Opaque board configuration.
    pub board_config: Value,
}

fn required(key: &'static str) -> FleetResult<String> {
    match std::env::var(key) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(FleetError::WorkerEnv(key.to_string())),
    }
}

impl WorkerEnv {
    /// Read the contract from the process environment.
    pub fn from_env() -> FleetResult<Self> {
        let board_raw = required(ENV_BOARD_CONFIG)?;
        let board_config: Value = serde_json::from_str(&board_raw)?;
        Ok(Self {
            device_id: required(ENV_DEVICE_ID)?,
            namespace: required(ENV_NAMESPACE)?,
            project: required(ENV_PROJECT)?,
            bus_dir: PathBuf::from(required(ENV_BUS_DIR)?),
            board_config,
        })
    }

    /// Render the contract as environment variables for a spawned process.
    pub fn to_vars(&self) -> FleetResult<Vec<(&'static str, String)>> {
        Ok(vec![
            (ENV_DEVICE_ID, self.device_id.clone()),
            (ENV_NAMESPACE, self.namespace.clone()),
            (ENV_PROJECT, self.project.clone()),
            (ENV_BUS_DIR, self.bus_dir.display().to_string()),
            (ENV_BOARD_CONFIG, serde_json::to_string(&self.board_config)?),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trips_through_variables() {
        let env = WorkerEnv {
            device_id: "porch".into(),
            namespace: "home".into(),
            project: "demo".into(),
            bus_dir: PathBuf::from("/tmp/spool"),
            board_config: json!({"driver": "sim"}),
        };
        let vars = env.to_vars().unwrap();
        assert_eq!(vars.len(), 5);
        let board = vars
            .iter()
            .find(|(k, _)| *k == ENV_BOARD_CONFIG)
            .map(|(_, v)| v.clone())
            .unwrap();
        let parsed: Value = serde_json::from_str(&board).unwrap();
        assert_eq!(parsed["driver"], "sim");
    }
}
