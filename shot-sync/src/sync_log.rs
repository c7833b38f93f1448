//! Human-readable event log at `.ufb/sync.log`
//!
//! Writing is best-effort; failures are logged and swallowed.

use chrono::Local;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Kinds of events written to `sync.log`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEvent {
    Backup,
    Restore,
    Evict,
    Archive,
    Snapshot,
    LockRemoved,
}

impl SyncEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncEvent::Backup => "BACKUP",
            SyncEvent::Restore => "RESTORE",
            SyncEvent::Evict => "EVICT",
            SyncEvent::Archive => "ARCHIVE",
            SyncEvent::Snapshot => "SNAPSHOT",
            SyncEvent::LockRemoved => "LOCK_REMOVED",
        }
    }
}

/// Appender for one job's `sync.log`
#[derive(Debug, Clone)]
pub struct SyncLog {
    path: PathBuf,
    device_id: String,
}

impl SyncLog {
    pub fn new(path: impl Into<PathBuf>, device_id: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            device_id: device_id.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends `[time] [device] EVENT details`
    pub fn record(&self, event: SyncEvent, details: &str) {
        let line = format!(
            "[{}] [{}] {} {}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            self.device_id,
            event.as_str(),
            details
        );

        if let Err(e) = self.append(&line) {
            log::warn!("Could not write to {}: {}", self.path.display(), e);
        }
    }

    fn append(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.flush()
    }
}
