//! Bootstrap snapshot: a cached materialized state used as a read baseline
//!
//! The snapshot is a cache. It may be stale or missing at any time, and every
//! reader still replays the full logs on top of it.

use crate::error::SyncResult;
use crate::fs_util;
use crate::models::{now_millis, ShotMap};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Materialized state dump with creation metadata
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapSnapshot {
    /// Creation time (epoch ms)
    pub created_at: u64,
    #[serde(default)]
    pub created_by: String,
    #[serde(default)]
    pub shot_count: usize,
    #[serde(default)]
    pub shots: ShotMap,
}

/// Reads and writes `bootstrap-snapshot.json`
#[derive(Debug, Clone)]
pub struct BootstrapSnapshotStore {
    path: PathBuf,
}

impl BootstrapSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The snapshot, or `None` if absent or unreadable
    pub fn read_snapshot(&self) -> Option<BootstrapSnapshot> {
        match fs_util::read_json_file::<BootstrapSnapshot>(&self.path) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                log::warn!(
                    "Ignoring unreadable bootstrap snapshot {}: {}",
                    self.path.display(),
                    e
                );
                None
            }
        }
    }

    /// Baseline state; empty when there is no usable snapshot
    pub fn read_bootstrap_snapshot(&self) -> ShotMap {
        self.read_snapshot().map(|s| s.shots).unwrap_or_default()
    }

    pub fn write_snapshot(&self, snapshot: &BootstrapSnapshot) -> SyncResult<()> {
        fs_util::write_json_atomic(&self.path, snapshot)?;
        log::info!(
            "Wrote bootstrap snapshot with {} shots to {}",
            snapshot.shot_count,
            self.path.display()
        );
        Ok(())
    }

    /// Stores `shots` as the new snapshot
    pub fn create_snapshot(&self, shots: ShotMap, device_id: &str) -> SyncResult<BootstrapSnapshot> {
        let snapshot = BootstrapSnapshot {
            created_at: now_millis(),
            created_by: device_id.to_string(),
            shot_count: shots.len(),
            shots,
        };
        self.write_snapshot(&snapshot)?;
        Ok(snapshot)
    }

    /// Whether a snapshot younger than `max_age_hours` exists at `now_ms`
    pub fn has_recent_snapshot_at(&self, max_age_hours: u64, now_ms: u64) -> bool {
        let Some(snapshot) = self.read_snapshot() else {
            return false;
        };
        let max_age_ms = max_age_hours.saturating_mul(3_600_000);
        now_ms.saturating_sub(snapshot.created_at) <= max_age_ms
    }

    pub fn has_recent_snapshot(&self, max_age_hours: u64) -> bool {
        self.has_recent_snapshot_at(max_age_hours, now_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Shot;
    use tempfile::TempDir;

    fn shots(paths: &[&str]) -> ShotMap {
        paths
            .iter()
            .map(|p| (p.to_string(), Shot::new(*p, "shot")))
            .collect()
    }

    #[test]
    fn test_absent_snapshot_is_empty_baseline() {
        let dir = TempDir::new().unwrap();
        let store = BootstrapSnapshotStore::new(dir.path().join("bootstrap-snapshot.json"));
        assert!(store.read_bootstrap_snapshot().is_empty());
        assert!(!store.has_recent_snapshot(24));
    }

    #[test]
    fn test_create_and_read() {
        let dir = TempDir::new().unwrap();
        let store = BootstrapSnapshotStore::new(dir.path().join("bootstrap-snapshot.json"));

        let snapshot = store.create_snapshot(shots(&["a", "b"]), "dev-a").unwrap();
        assert_eq!(snapshot.shot_count, 2);
        assert_eq!(store.read_bootstrap_snapshot().len(), 2);
        assert!(store.has_recent_snapshot(24));
    }

    #[test]
    fn test_staleness() {
        let dir = TempDir::new().unwrap();
        let store = BootstrapSnapshotStore::new(dir.path().join("bootstrap-snapshot.json"));
        store
            .write_snapshot(&BootstrapSnapshot {
                created_at: 1_000,
                created_by: "dev-a".to_string(),
                shot_count: 0,
                shots: ShotMap::new(),
            })
            .unwrap();

        let hour = 3_600_000;
        assert!(store.has_recent_snapshot_at(24, 1_000 + 24 * hour));
        assert!(!store.has_recent_snapshot_at(24, 1_000 + 24 * hour + 1));
    }

    #[test]
    fn test_corrupt_snapshot_is_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bootstrap-snapshot.json");
        std::fs::write(&path, "{\"createdAt\": ").unwrap();
        let store = BootstrapSnapshotStore::new(path);
        assert!(store.read_snapshot().is_none());
        assert!(store.read_bootstrap_snapshot().is_empty());
    }
}
