//! Reads, writes and compacts the change logs of one job

use crate::bootstrap::{BootstrapSnapshot, BootstrapSnapshotStore};
use crate::context::SyncContext;
use crate::error::{SyncError, SyncResult};
use crate::materialize;
use crate::models::{now_millis, ArchiveFileInfo, ChangeLogEntry, Shot, ShotMap};
use crate::paths::JobPaths;
use crate::reader::{ReadOptions, ReadOutcome, RetryingLogReader};
use crate::retry::CancelSignal;
use crate::store::ChangeLogStore;
use crate::sync_log::{SyncEvent, SyncLog};
use chrono::{DateTime, Datelike, Duration, Local, TimeZone, Utc};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

/// What an archival pass moved
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveReport {
    /// Entries moved out of the active log
    pub archived: usize,
    /// Entries left in the active log
    pub remaining: usize,
    /// Archive months written, as `(year, month)`
    pub months: Vec<(i32, u32)>,
}

/// Entry point for state reads, local writes and compaction of one job
#[derive(Debug, Clone)]
pub struct ArchivalManager {
    ctx: SyncContext,
    paths: JobPaths,
    reader: RetryingLogReader,
    bootstrap: BootstrapSnapshotStore,
    sync_log: SyncLog,
}

impl ArchivalManager {
    pub fn new(ctx: &SyncContext, job_path: impl Into<PathBuf>) -> Self {
        let paths = JobPaths::new(job_path);
        let reader = RetryingLogReader::new(paths.changes_dir(), ctx.config());
        let bootstrap = BootstrapSnapshotStore::new(reader.store().bootstrap_path());
        let sync_log = SyncLog::new(paths.sync_log(), ctx.device_id());
        Self {
            ctx: ctx.clone(),
            paths,
            reader,
            bootstrap,
            sync_log,
        }
    }

    pub fn paths(&self) -> &JobPaths {
        &self.paths
    }

    pub fn store(&self) -> &ChangeLogStore {
        self.reader.store()
    }

    /// Merged state of every device's logs on top of the bootstrap baseline
    pub async fn read_all_change_logs(
        &self,
        options: &ReadOptions,
        cancel: &CancelSignal,
    ) -> SyncResult<ReadOutcome> {
        let outcome = self.reader.read(options, cancel).await?;
        log::debug!(
            "Read {} entries from {} device(s) in {}: {} shots",
            outcome.entries_read,
            outcome.devices.len(),
            self.paths.job_path().display(),
            outcome.shots.len()
        );
        Ok(outcome)
    }

    pub async fn current_state(&self, cancel: &CancelSignal) -> SyncResult<ShotMap> {
        Ok(self
            .read_all_change_logs(&ReadOptions::default(), cancel)
            .await?
            .shots)
    }

    /// Appends an update for `shot` to this device's log
    ///
    /// The shot is stamped with this device's id and a timestamp that never
    /// goes below the device's previous entry.
    pub async fn record_update(&self, mut shot: Shot) -> SyncResult<ChangeLogEntry> {
        let _guard = self.ctx.locks().lock(self.paths.job_path()).await;
        let timestamp = self.next_timestamp()?;

        shot.modified_time = timestamp;
        shot.device_id = self.ctx.device_id().to_string();
        if shot.created_time == 0 {
            shot.created_time = timestamp;
        }

        let entry = ChangeLogEntry::update(self.ctx.device_id(), timestamp, shot);
        self.store()
            .append_entries(self.ctx.device_id(), std::slice::from_ref(&entry))?;
        Ok(entry)
    }

    /// Appends a tombstone for `shot_path` to this device's log
    pub async fn record_delete(&self, shot_path: &str) -> SyncResult<ChangeLogEntry> {
        let _guard = self.ctx.locks().lock(self.paths.job_path()).await;
        let timestamp = self.next_timestamp()?;

        let entry = ChangeLogEntry::delete(self.ctx.device_id(), timestamp, shot_path);
        self.store()
            .append_entries(self.ctx.device_id(), std::slice::from_ref(&entry))?;
        Ok(entry)
    }

    fn next_timestamp(&self) -> SyncResult<u64> {
        let last = self
            .store()
            .read_active_log(self.ctx.device_id())?
            .iter()
            .map(|e| e.timestamp)
            .max()
            .unwrap_or(0);
        Ok(now_millis().max(last))
    }

    /// Moves this device's entries older than `days_threshold` into monthly archives
    pub async fn archive_old_entries(&self, days_threshold: u32) -> SyncResult<ArchiveReport> {
        self.archive_old_entries_at(Local::now(), days_threshold).await
    }

    /// [`Self::archive_old_entries`] with an explicit "now"
    ///
    /// Archive files are merged as old ∪ new. The active log is only
    /// rewritten once every archive write succeeded, so a failed pass can
    /// simply be retried.
    pub async fn archive_old_entries_at(
        &self,
        now: DateTime<Local>,
        days_threshold: u32,
    ) -> SyncResult<ArchiveReport> {
        let _guard = self.ctx.locks().lock(self.paths.job_path()).await;
        let device_id = self.ctx.device_id();
        let store = self.store();

        let active = store.read_active_log(device_id)?;
        if active.is_empty() {
            return Ok(ArchiveReport::default());
        }

        let cutoff = now - Duration::days(i64::from(days_threshold));
        let cutoff_ms = cutoff.timestamp_millis().max(0) as u64;
        let (old, recent): (Vec<ChangeLogEntry>, Vec<ChangeLogEntry>) =
            active.into_iter().partition(|e| e.timestamp < cutoff_ms);

        if old.is_empty() {
            return Ok(ArchiveReport {
                archived: 0,
                remaining: recent.len(),
                months: Vec::new(),
            });
        }

        let mut groups: BTreeMap<(i32, u32), Vec<ChangeLogEntry>> = BTreeMap::new();
        for entry in &old {
            groups
                .entry(local_year_month(entry.timestamp))
                .or_default()
                .push(entry.clone());
        }

        for ((year, month), group) in &groups {
            let path = store.archive_path(device_id, *year, *month);
            let write = store
                .read_archive(device_id, *year, *month)
                .and_then(|existing| merge_archive(existing, group, &path))
                .and_then(|merged| store.write_archive(device_id, *year, *month, &merged));
            if let Err(e) = write {
                log::error!(
                    "Archiving {}-{:02} for device {} failed, active log left untouched: {}",
                    year,
                    month,
                    device_id,
                    e
                );
                return Err(e);
            }
        }

        store.write_active_log(device_id, &recent)?;

        let report = ArchiveReport {
            archived: old.len(),
            remaining: recent.len(),
            months: groups.keys().copied().collect(),
        };
        log::info!(
            "Archived {} entries of device {} into {} month(s), {} remain active",
            report.archived,
            device_id,
            report.months.len(),
            report.remaining
        );
        self.sync_log.record(
            SyncEvent::Archive,
            &format!(
                "archived {} entries older than {} days into {} month(s)",
                report.archived,
                days_threshold,
                report.months.len()
            ),
        );
        Ok(report)
    }

    /// Archive files, optionally for one device, oldest month first
    pub fn get_archive_files(&self, device_id: Option<&str>) -> SyncResult<Vec<ArchiveFileInfo>> {
        self.store().list_archive_files(device_id)
    }

    /// Stores the current merged state as the bootstrap baseline
    pub async fn create_bootstrap_snapshot(&self, cancel: &CancelSignal) -> SyncResult<BootstrapSnapshot> {
        let _guard = self.ctx.locks().lock(self.paths.job_path()).await;
        let outcome = self.reader.read(&ReadOptions::default(), cancel).await?;
        if !outcome.failed_devices.is_empty() {
            log::warn!(
                "Bootstrap snapshot skips unreadable devices: {}",
                outcome.failed_devices.join(", ")
            );
        }

        let snapshot = self
            .bootstrap
            .create_snapshot(outcome.shots, self.ctx.device_id())?;
        self.sync_log.record(
            SyncEvent::Snapshot,
            &format!("bootstrap snapshot with {} shots", snapshot.shot_count),
        );
        Ok(snapshot)
    }

    pub fn read_bootstrap_snapshot(&self) -> ShotMap {
        self.bootstrap.read_bootstrap_snapshot()
    }

    pub fn has_recent_bootstrap_snapshot(&self, max_age_hours: u64) -> bool {
        self.bootstrap.has_recent_snapshot(max_age_hours)
    }
}

/// Local `(year, month)` of an epoch-ms timestamp
fn local_year_month(timestamp: u64) -> (i32, u32) {
    let ms = i64::try_from(timestamp).unwrap_or(i64::MAX);
    match Local.timestamp_millis_opt(ms).earliest() {
        Some(at) => (at.year(), at.month()),
        None => {
            let at = DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default();
            (at.year(), at.month())
        }
    }
}

/// Union of an existing archive and new entries, without duplicates
fn merge_archive(
    existing: Vec<ChangeLogEntry>,
    new_entries: &[ChangeLogEntry],
    path: &std::path::Path,
) -> SyncResult<Vec<ChangeLogEntry>> {
    let mut seen = HashSet::new();
    let mut merged = Vec::with_capacity(existing.len() + new_entries.len());

    for entry in existing.into_iter().chain(new_entries.iter().cloned()) {
        let key = serde_json::to_string(&entry).map_err(|e| SyncError::json(path, e))?;
        if seen.insert(key) {
            merged.push(entry);
        }
    }

    materialize::sort_entries(&mut merged);
    Ok(merged)
}
