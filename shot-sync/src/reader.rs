//! Change-log reads that tolerate propagation lag on shared folders
//!
//! A write made on one device may take seconds to show up on another when
//! the job lives on an SMB share or a cloud-synced folder. Callers that know
//! a write should exist pass the writer's device id and the write time; the
//! reader then keeps re-scanning with backoff until an entry from that device
//! at least that recent is visible, or the retry policy runs out.

use crate::bootstrap::BootstrapSnapshotStore;
use crate::config::{RetryPolicy, SyncConfig};
use crate::error::SyncResult;
use crate::materialize;
use crate::models::{ChangeLogEntry, ShotMap};
use crate::retry::{retry_until, Attempt, CancelSignal};
use crate::store::ChangeLogStore;
use std::collections::BTreeSet;
use std::path::PathBuf;

/// What a caller expects to see, and which entries to consider
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadOptions {
    /// Always scanned, even before its log file is visible
    pub expected_device_id: Option<String>,
    /// Write time that must be visible from the expected device
    pub min_timestamp: Option<u64>,
    /// Read only the expected device's logs
    pub only_expected_device: bool,
    /// Drop entries older than this (epoch ms)
    pub since: Option<u64>,
}

impl ReadOptions {
    /// Waits for a write made by `device_id` at `min_timestamp`
    pub fn expecting(device_id: impl Into<String>, min_timestamp: u64) -> Self {
        Self {
            expected_device_id: Some(device_id.into()),
            min_timestamp: Some(min_timestamp),
            ..Self::default()
        }
    }
}

/// Materialized state plus what it took to get there
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadOutcome {
    pub shots: ShotMap,
    pub entries_read: usize,
    /// Devices scanned in the final attempt
    pub devices: Vec<String>,
    pub attempts: u32,
    /// False when the expected write never became visible
    pub verified: bool,
    /// Devices whose logs could not be read in the final attempt
    pub failed_devices: Vec<String>,
}

/// One scan of the changes directory
struct Scan {
    entries: Vec<ChangeLogEntry>,
    devices: Vec<String>,
    failed_devices: Vec<String>,
}

/// Reads all device logs below one `changes/` directory
#[derive(Debug, Clone)]
pub struct RetryingLogReader {
    store: ChangeLogStore,
    bootstrap: BootstrapSnapshotStore,
    retry: RetryPolicy,
    clock_skew_tolerance_ms: u64,
}

impl RetryingLogReader {
    pub fn new(changes_dir: impl Into<PathBuf>, config: &SyncConfig) -> Self {
        let store = ChangeLogStore::new(changes_dir);
        let bootstrap = BootstrapSnapshotStore::new(store.bootstrap_path());
        Self {
            store,
            bootstrap,
            retry: config.read_retry,
            clock_skew_tolerance_ms: config.clock_skew_tolerance_ms,
        }
    }

    pub fn store(&self) -> &ChangeLogStore {
        &self.store
    }

    /// Reads, verifies and materializes the current state
    ///
    /// Missing files are never an error. Cancellation only interrupts the
    /// backoff sleep; nothing on disk is modified.
    pub async fn read(&self, options: &ReadOptions, cancel: &CancelSignal) -> SyncResult<ReadOutcome> {
        let baseline = self.bootstrap.read_bootstrap_snapshot();

        let outcome = retry_until(&self.retry, cancel, |_attempt| {
            std::future::ready(self.scan(options).map(|scan| {
                if self.contains_expected_write(&scan.entries, options) {
                    Attempt::Done(scan)
                } else {
                    Attempt::Retry(scan)
                }
            }))
        })
        .await?;

        if !outcome.satisfied {
            log::warn!(
                "Expected write from device {} not visible after {} attempts, using what is readable",
                options.expected_device_id.as_deref().unwrap_or("?"),
                outcome.attempts
            );
        } else if outcome.attempts > 1 {
            log::info!("Expected write became visible after {} attempts", outcome.attempts);
        }

        let scan = outcome.value;
        Ok(ReadOutcome {
            shots: materialize::materialize(&scan.entries, &baseline),
            entries_read: scan.entries.len(),
            devices: scan.devices,
            attempts: outcome.attempts,
            verified: outcome.satisfied,
            failed_devices: scan.failed_devices,
        })
    }

    fn scan(&self, options: &ReadOptions) -> SyncResult<Scan> {
        let mut devices: BTreeSet<String> = self.store.list_device_ids()?;
        if let Some(expected) = &options.expected_device_id {
            devices.insert(expected.clone());
            if options.only_expected_device {
                devices.retain(|id| id == expected);
            }
        }

        let collected = self.store.collect_entries(&devices, options.since);
        let mut entries = collected.entries;
        materialize::sort_entries(&mut entries);

        Ok(Scan {
            entries,
            devices: devices.into_iter().collect(),
            failed_devices: collected.failed_devices,
        })
    }

    /// True when no write is expected or the expected one is visible
    fn contains_expected_write(&self, sorted: &[ChangeLogEntry], options: &ReadOptions) -> bool {
        let (Some(device_id), Some(min_ts)) = (&options.expected_device_id, options.min_timestamp)
        else {
            return true;
        };
        let threshold = min_ts.saturating_sub(self.clock_skew_tolerance_ms);
        sorted
            .iter()
            .any(|e| &e.device_id == device_id && e.observed_time() >= threshold)
    }
}
