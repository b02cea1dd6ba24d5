//! Rewrite configuration.
//!
//! Values are layered, lowest priority first:
//!   1. Built-in defaults (single replica, single worker, chief).
//!   2. An optional TOML file.
//!   3. Environment variables prefixed with `PS_SYNC_` (e.g. `PS_SYNC_NUM_WORKERS=4`).
//!
//! Example:
//! ```toml
//! num_replicas = 2
//! num_workers = 4
//! worker_id = 1
//! worker_device = "/job:worker/task:1"
//! reduction_destinations = ["/job:ps/task:0/device:CPU:0"]
//! local_replication = true
//! ```

use crate::error::{Result, SyncError};
use crate::graph::DeviceSpec;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// ENV prefix for configuration overrides
const CONFIG_ENV_PREFIX: &str = "PS_SYNC_";

/// Per-process settings of the rewrite pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Replicas per worker.
    pub num_replicas: usize,
    /// Number of worker processes.
    pub num_workers: usize,
    /// Ordinal of this worker; worker 0 is the chief.
    pub worker_id: usize,
    /// Device of this worker, e.g. `/job:worker/task:0`.
    pub worker_device: String,
    /// Parameter-server devices; the first one is the placement template.
    pub reduction_destinations: Vec<String>,
    /// Mirror dense variables onto each local replica.
    pub local_replication: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            num_replicas: 1,
            num_workers: 1,
            worker_id: 0,
            worker_device: "/job:worker/task:0".to_string(),
            reduction_destinations: Vec::new(),
            local_replication: false,
        }
    }
}

impl SyncConfig {
    /// Loads defaults, then `path` (if any), then `PS_SYNC_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(SyncConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        let config: SyncConfig = figment
            .merge(Env::prefixed(CONFIG_ENV_PREFIX).ignore(&["log"]))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_replicas == 0 {
            return Err(SyncError::Config("num_replicas must be at least 1".to_string()));
        }
        if self.num_workers == 0 {
            return Err(SyncError::Config("num_workers must be at least 1".to_string()));
        }
        if self.worker_id >= self.num_workers {
            return Err(SyncError::Config(format!(
                "worker_id {} out of range for {} workers",
                self.worker_id, self.num_workers
            )));
        }
        DeviceSpec::parse(&self.worker_device)?;
        for destination in &self.reduction_destinations {
            DeviceSpec::parse(destination)?;
        }
        Ok(())
    }

    pub fn worker_device(&self) -> Result<DeviceSpec> {
        DeviceSpec::parse(&self.worker_device)
    }

    /// This worker's CPU, where mirror updates are grouped.
    pub fn worker_cpu(&self) -> Result<DeviceSpec> {
        Ok(self.worker_device()?.with_device("CPU", 0))
    }

    /// Template device for placing aggregation ops on parameter servers.
    pub fn target_device(&self) -> Result<DeviceSpec> {
        match self.reduction_destinations.first() {
            Some(device) => DeviceSpec::parse(device),
            None => Ok(DeviceSpec::default()),
        }
    }
}
