use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Materialized state: shot path -> current shot
pub type ShotMap = BTreeMap<String, Shot>;

/// Current-state snapshot of one tracked shot
///
/// `metadata` is an opaque blob owned by the metadata layer and passed
/// through untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Shot {
    pub shot_path: String,
    #[serde(default)]
    pub shot_type: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub created_time: u64,
    #[serde(default)]
    pub modified_time: u64,
    #[serde(default)]
    pub device_id: String,
}

impl Shot {
    pub fn new(shot_path: impl Into<String>, shot_type: impl Into<String>) -> Self {
        Self {
            shot_path: shot_path.into(),
            shot_type: shot_type.into(),
            display_name: String::new(),
            metadata: serde_json::Value::Null,
            created_time: 0,
            modified_time: 0,
            device_id: String::new(),
        }
    }
}

/// Kind of mutation recorded in a change log
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Update,
    Delete,
}

/// One immutable mutation record in a device's change log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChangeLogEntry {
    pub device_id: String,
    pub timestamp: u64,
    pub operation: Operation,
    pub shot_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Shot>,
}

impl ChangeLogEntry {
    /// Update entry for `shot`, stamped with `timestamp`
    pub fn update(device_id: impl Into<String>, timestamp: u64, shot: Shot) -> Self {
        Self {
            device_id: device_id.into(),
            timestamp,
            operation: Operation::Update,
            shot_path: shot.shot_path.clone(),
            data: Some(shot),
        }
    }

    /// Delete entry (tombstone) for `shot_path`
    pub fn delete(device_id: impl Into<String>, timestamp: u64, shot_path: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            timestamp,
            operation: Operation::Delete,
            shot_path: shot_path.into(),
            data: None,
        }
    }

    /// Time used to decide whether an expected write has arrived
    pub fn observed_time(&self) -> u64 {
        match &self.data {
            Some(shot) => shot.modified_time,
            None => self.timestamp,
        }
    }

    /// Rewrites the entry timestamp and, for updates, the shot's modified time
    pub fn restamp(&mut self, timestamp: u64) {
        self.timestamp = timestamp;
        if let Some(shot) = self.data.as_mut() {
            shot.modified_time = timestamp;
        }
    }
}

/// One backup recorded in `backup_metadata.json`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupInfo {
    /// Creation time (epoch ms)
    pub timestamp: u64,
    /// Backup stamp, `YYYY-MM-DD_HHMMSS`; folders are `changes_<filename>` etc.
    pub filename: String,
    pub created_by: String,
    pub shot_count: usize,
    pub uncompressed_size: u64,
    /// Local calendar date, `YYYY-MM-DD`
    pub date: String,
}

/// Contents of `backups/backup_metadata.json`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupMetadata {
    #[serde(default)]
    pub backups: Vec<BackupInfo>,
    #[serde(default)]
    pub last_backup_date: Option<String>,
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
}

fn default_retention_days() -> i64 {
    30
}

impl Default for BackupMetadata {
    fn default() -> Self {
        Self {
            backups: Vec::new(),
            last_backup_date: None,
            retention_days: default_retention_days(),
        }
    }
}

/// Health of a JSON payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationResult {
    Valid,
    Corrupt,
    Missing,
    Empty,
    VersionMismatch,
}

impl ValidationResult {
    pub fn is_valid(self) -> bool {
        self == ValidationResult::Valid
    }
}

/// A monthly archive file found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveFileInfo {
    pub device_id: String,
    pub year: i32,
    pub month: u32,
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Current wall-clock time in epoch milliseconds
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
