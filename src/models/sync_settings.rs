use serde::{Deserialize, Serialize};
use shot_sync::SyncConfig;
use std::path::PathBuf;

/// Settings of the maintenance tool, stored as TOML
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncSettings {
    /// Identity of this machine in every job's change logs
    pub device_id: String,
    /// Job directories maintained by `run`
    pub jobs: Vec<PathBuf>,
    pub enabled: bool,
    pub maintenance_interval_secs: u64,
    /// Wait after a cycle with failures
    pub retry_delay_secs: u64,
    pub daily_backup: bool,
    pub sync: SyncConfig,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            device_id: String::new(),
            jobs: Vec::new(),
            enabled: true,
            maintenance_interval_secs: 3600,
            retry_delay_secs: 60,
            daily_backup: true,
            sync: SyncConfig::default(),
        }
    }
}

impl SyncSettings {
    pub fn new(device_id: String) -> Self {
        Self {
            device_id,
            ..Self::default()
        }
    }
}
