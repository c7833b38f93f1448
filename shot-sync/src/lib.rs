//! # Shot Sync
//!
//! Serverless multi-device synchronization for production job directories.
//!
//! Every device appends to its own change log below `<job>/.ufb/changes/`;
//! readers merge all logs with last-write-wins ordered by
//! `(timestamp, deviceId)`. This crate provides:
//! - Change-log storage with monthly archives and a bootstrap snapshot
//! - Reads that retry until an expected peer write has propagated
//! - Compaction of old entries into archives without losing history
//! - Backups with an advisory cross-device lock, restore that wins against
//!   concurrent writers, and tiered retention
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use shot_sync::{ArchivalManager, CancelSignal, ReadOptions, SyncConfig, SyncContext};
//!
//! let ctx = SyncContext::new(device_id, SyncConfig::default());
//! let archival = ArchivalManager::new(&ctx, "/jobs/show");
//!
//! let outcome = archival
//!     .read_all_change_logs(&ReadOptions::default(), &CancelSignal::never())
//!     .await?;
//! println!("{} shots", outcome.shots.len());
//! ```

pub mod archival;
pub mod backup;
pub mod backup_lock;
pub mod bootstrap;
pub mod config;
pub mod context;
pub mod error;
pub mod fs_util;
pub mod materialize;
pub mod models;
pub mod paths;
pub mod reader;
pub mod retention;
pub mod retry;
pub mod store;
pub mod sync_log;
pub mod validate;

pub use archival::{ArchivalManager, ArchiveReport};
pub use backup::{BackupManager, BackupPhase, RestoreReport};
pub use backup_lock::{BackupLock, LockHolder};
pub use bootstrap::{BootstrapSnapshot, BootstrapSnapshotStore};
pub use config::{Backoff, RetryPolicy, SyncConfig, CLOCK_SKEW_TOLERANCE_MS};
pub use context::{JobLocks, SyncContext};
pub use error::{SyncError, SyncResult};
pub use models::{
    ArchiveFileInfo, BackupInfo, BackupMetadata, ChangeLogEntry, Operation, Shot, ShotMap,
    ValidationResult,
};
pub use paths::JobPaths;
pub use reader::{ReadOptions, ReadOutcome, RetryingLogReader};
pub use retry::{cancel_pair, CancelHandle, CancelSignal};
pub use store::ChangeLogStore;
