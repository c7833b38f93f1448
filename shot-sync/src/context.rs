//! Shared engine resources: device identity, tunables and per-job locks

use crate::config::SyncConfig;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Registry of in-process mutexes, one per job directory
///
/// Archival and backup operations on the same job hold the job's mutex so
/// they never overlap inside one process. Other devices are not covered;
/// they coordinate through the backup lock file.
#[derive(Debug, Default)]
pub struct JobLocks {
    locks: Mutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>,
}

/// Held while an operation owns a job directory
pub type JobGuard = OwnedMutexGuard<()>;

impl JobLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, job_path: &Path) -> Arc<AsyncMutex<()>> {
        let key = job_path
            .canonicalize()
            .unwrap_or_else(|_| job_path.to_path_buf());
        // A poisoned map is still consistent
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(key)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Waits until no other operation in this process holds the job
    pub async fn lock(&self, job_path: &Path) -> JobGuard {
        self.lock_for(job_path).lock_owned().await
    }

    /// Acquires the job only if it is free right now
    pub fn try_lock(&self, job_path: &Path) -> Option<JobGuard> {
        self.lock_for(job_path).try_lock_owned().ok()
    }
}

/// Explicit shared resource handed to every manager
#[derive(Debug, Clone)]
pub struct SyncContext {
    device_id: String,
    config: SyncConfig,
    locks: Arc<JobLocks>,
}

impl SyncContext {
    pub fn new(device_id: impl Into<String>, config: SyncConfig) -> Self {
        Self {
            device_id: device_id.into(),
            config,
            locks: Arc::new(JobLocks::new()),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn locks(&self) -> &JobLocks {
        &self.locks
    }

    /// Same locks and config, acting as another device
    pub fn for_device(&self, device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            config: self.config.clone(),
            locks: self.locks.clone(),
        }
    }
}
