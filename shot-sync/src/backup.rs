//! Backup, restore and retention of a job's sync directory
//!
//! A backup copies three independent components into `.ufb/backups/`:
//! the legacy `shots.json` (only if it validates), the whole `changes/`
//! tree and the `tasks/` tree. Any subset may fail; the backup succeeds as
//! long as one component was copied.
//!
//! Restoring replaces `changes/` with the backup copy and restamps every
//! restored entry to the restore time, so the restored state outranks
//! anything other devices wrote before the restore. The legacy `shots.json`
//! is only overwritten once the new `changes/` is in place.
//!
//! `backup_metadata.json` is an index over the backup folders, not the source
//! of truth: folders without a record are listed anyway, and an unparseable
//! index is set aside and rebuilt from the folders.

use crate::backup_lock::{BackupLock, LockSettings};
use crate::bootstrap::BootstrapSnapshotStore;
use crate::config::RetryPolicy;
use crate::context::SyncContext;
use crate::error::{SyncError, SyncResult};
use crate::fs_util;
use crate::materialize;
use crate::models::{now_millis, BackupInfo, BackupMetadata, ChangeLogEntry, ShotMap, ValidationResult};
use crate::paths::{self, JobPaths};
use crate::retention;
use crate::retry::CancelSignal;
use crate::store::ChangeLogStore;
use crate::sync_log::{SyncEvent, SyncLog};
use crate::validate;
use chrono::{DateTime, Local, NaiveDate};
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Steps of one backup cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupPhase {
    Idle,
    LockAcquired,
    Snapshotting,
    MetadataWritten,
    LockReleased,
}

/// Summary of a finished restore
#[derive(Debug, Clone, PartialEq)]
pub struct RestoreReport {
    pub backup: BackupInfo,
    /// Timestamp given to the winning entry of every shot (epoch ms)
    pub restored_at: u64,
    pub entries_rewritten: usize,
    pub files_rewritten: usize,
    /// Shots in the restored state
    pub shot_count: usize,
    pub tasks_restored: bool,
    /// Where the pre-restore `shots.json` was saved, if there was one
    pub safety_copy: Option<PathBuf>,
}

/// Backup and restore for one job
#[derive(Debug, Clone)]
pub struct BackupManager {
    ctx: SyncContext,
    paths: JobPaths,
    sync_log: SyncLog,
}

impl BackupManager {
    pub fn new(ctx: &SyncContext, job_path: impl Into<PathBuf>) -> Self {
        let paths = JobPaths::new(job_path);
        let sync_log = SyncLog::new(paths.sync_log(), ctx.device_id());
        Self {
            ctx: ctx.clone(),
            paths,
            sync_log,
        }
    }

    pub fn paths(&self) -> &JobPaths {
        &self.paths
    }

    fn lock_settings(&self, timeout: Duration) -> LockSettings {
        let config = self.ctx.config();
        LockSettings {
            stale_after: Duration::from_secs(config.lock_stale_after_secs),
            timeout,
            poll_interval: Duration::from_millis(config.lock_poll_interval_ms),
        }
    }

    /// Takes the cross-device backup lock, waiting up to `timeout`
    pub async fn try_acquire_backup_lock(
        &self,
        timeout: Duration,
        cancel: &CancelSignal,
    ) -> SyncResult<BackupLock> {
        let lock = BackupLock::acquire(
            &self.paths.backup_lock(),
            self.ctx.device_id(),
            self.lock_settings(timeout),
            cancel,
        )
        .await?;
        if let Some(previous) = lock.replaced() {
            self.sync_log.record(
                SyncEvent::LockRemoved,
                &format!("removed abandoned lock \"{}\"", previous),
            );
        }
        Ok(lock)
    }

    async fn acquire_default_lock(&self, cancel: &CancelSignal) -> SyncResult<BackupLock> {
        let timeout = Duration::from_secs(self.ctx.config().lock_timeout_secs);
        self.try_acquire_backup_lock(timeout, cancel).await
    }

    fn enter(&self, phase: BackupPhase) {
        log::debug!(
            "Backup of {}: {:?}",
            self.paths.job_path().display(),
            phase
        );
    }

    pub async fn create_backup(&self, cancel: &CancelSignal) -> SyncResult<BackupInfo> {
        self.create_backup_at(Local::now(), cancel).await
    }

    /// Snapshots the sync directory as of `now`
    pub async fn create_backup_at(
        &self,
        now: DateTime<Local>,
        cancel: &CancelSignal,
    ) -> SyncResult<BackupInfo> {
        let _guard = self.ctx.locks().lock(self.paths.job_path()).await;
        self.enter(BackupPhase::Idle);

        let lock = self.acquire_default_lock(cancel).await?;
        self.enter(BackupPhase::LockAcquired);
        let mut metadata = self.load_metadata(true)?;

        self.enter(BackupPhase::Snapshotting);
        let stamp = self.free_stamp(&paths::backup_stamp(&now));
        let mut size = 0u64;
        let mut changes_copied = false;
        let mut tasks_copied = false;

        let legacy_shots = match self.backup_legacy_shots(&stamp, cancel).await {
            Ok(copied) => copied,
            Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
            Err(e) => {
                log::error!("Backing up legacy shots.json failed: {}", e);
                None
            }
        };
        if let Some((bytes, _)) = legacy_shots {
            size += bytes;
        }

        match copy_component(&self.paths.changes_dir(), &self.paths.backup_changes_dir(&stamp)) {
            Ok(bytes) => {
                size += bytes;
                changes_copied = true;
            }
            Err(e) => log::error!("Backing up change logs failed: {}", e),
        }

        match copy_component(&self.paths.tasks_dir(), &self.paths.backup_tasks_dir(&stamp)) {
            Ok(bytes) => {
                size += bytes;
                tasks_copied = true;
            }
            Err(e) => log::warn!("Backing up tasks failed: {}", e),
        }

        if !changes_copied && !tasks_copied && legacy_shots.is_none() {
            lock.release()?;
            self.enter(BackupPhase::LockReleased);
            return Err(SyncError::NothingToBackup);
        }

        let shot_count = if changes_copied {
            materialize_changes_dir(&self.paths.backup_changes_dir(&stamp))
                .map(|state| state.len())
                .unwrap_or_else(|e| {
                    log::warn!("Could not count shots of backup {}: {}", stamp, e);
                    0
                })
        } else {
            legacy_shots.map(|(_, count)| count).unwrap_or(0)
        };

        let info = BackupInfo {
            timestamp: now.timestamp_millis().max(0) as u64,
            filename: stamp.clone(),
            created_by: self.ctx.device_id().to_string(),
            shot_count,
            uncompressed_size: size,
            date: now.format("%Y-%m-%d").to_string(),
        };

        metadata.backups.push(info.clone());
        metadata.last_backup_date = Some(info.date.clone());
        fs_util::write_json_atomic(&self.paths.backup_metadata(), &metadata)?;
        self.enter(BackupPhase::MetadataWritten);

        lock.release()?;
        self.enter(BackupPhase::LockReleased);

        log::info!(
            "Created backup {} ({} shots, {} bytes)",
            stamp,
            shot_count,
            size
        );
        self.sync_log.record(
            SyncEvent::Backup,
            &format!(
                "created {} shots={} bytes={} changes={} tasks={} legacy={}",
                stamp,
                shot_count,
                size,
                changes_copied,
                tasks_copied,
                legacy_shots.is_some()
            ),
        );
        Ok(info)
    }

    /// Appends `-2`, `-3`, ... when a backup with this stamp already exists
    fn free_stamp(&self, base: &str) -> String {
        let taken = |stamp: &str| {
            self.paths.backup_changes_dir(stamp).exists()
                || self.paths.backup_tasks_dir(stamp).exists()
                || self.paths.backup_shots_file(stamp).exists()
        };
        if !taken(base) {
            return base.to_string();
        }
        (2u32..)
            .map(|n| format!("{}-{}", base, n))
            .find(|candidate| !taken(candidate))
            .unwrap_or_else(|| format!("{}-{}", base, ulid::Ulid::new()))
    }

    /// Copies a valid `shots.json`; returns `(bytes, shot count)`
    async fn backup_legacy_shots(
        &self,
        stamp: &str,
        cancel: &CancelSignal,
    ) -> SyncResult<Option<(u64, usize)>> {
        let source = self.paths.legacy_shots();
        if !source.exists() {
            return Ok(None);
        }

        let config = self.ctx.config();
        let policy = RetryPolicy::linear_seconds(config.validation_max_retries);
        let health = validate::validate_json(&source, &policy, config.max_legacy_shots, cancel).await?;
        if health != ValidationResult::Valid {
            log::warn!("Skipping legacy shots.json in backup: {:?}", health);
            return Ok(None);
        }

        let target = self.paths.backup_shots_file(stamp);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = fs::copy(&source, &target)?;
        Ok(Some((bytes, legacy_shot_count(&source))))
    }

    /// Recorded backups plus backup folders that have no record
    pub fn read_metadata(&self) -> SyncResult<BackupMetadata> {
        self.load_metadata(false)
    }

    /// Like [`Self::read_metadata`]; with `set_aside_corrupt` an unparseable
    /// file is renamed out of the way before the caller rewrites it
    fn load_metadata(&self, set_aside_corrupt: bool) -> SyncResult<BackupMetadata> {
        let path = self.paths.backup_metadata();
        let mut metadata = match fs_util::read_json_file::<BackupMetadata>(&path) {
            Ok(metadata) => metadata.unwrap_or_default(),
            Err(e @ SyncError::Json { .. }) => {
                log::warn!("Backup metadata unreadable, rebuilding it from backup folders: {}", e);
                if set_aside_corrupt {
                    let aside = path.with_file_name(format!(
                        "backup_metadata.{}.corrupt.json",
                        ulid::Ulid::new()
                    ));
                    fs::rename(&path, &aside)?;
                    log::warn!("Saved unreadable backup metadata as {}", aside.display());
                }
                BackupMetadata::default()
            }
            Err(e) => return Err(e),
        };
        self.add_unrecorded_backups(&mut metadata)?;
        Ok(metadata)
    }

    fn add_unrecorded_backups(&self, metadata: &mut BackupMetadata) -> SyncResult<()> {
        let entries = match fs::read_dir(self.paths.backups_dir()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(SyncError::Io(e)),
        };

        let recorded: HashSet<&str> = metadata.backups.iter().map(|b| b.filename.as_str()).collect();
        let mut unrecorded = BTreeSet::new();
        for entry in entries {
            let name = entry?.file_name();
            if let Some(stamp) = name.to_str().and_then(paths::parse_backup_component) {
                if !recorded.contains(stamp.as_str()) {
                    unrecorded.insert(stamp);
                }
            }
        }

        for stamp in unrecorded {
            log::warn!("Backup {} has no metadata record, listing it anyway", stamp);
            metadata.backups.push(self.recovered_info(&stamp));
        }
        if metadata.last_backup_date.is_none() {
            metadata.last_backup_date = metadata
                .backups
                .iter()
                .max_by_key(|b| b.timestamp)
                .map(|b| b.date.clone());
        }
        Ok(())
    }

    /// Best reconstruction of a record from the backup's folders
    fn recovered_info(&self, stamp: &str) -> BackupInfo {
        let taken = paths::parse_backup_stamp(stamp);
        let changes = self.paths.backup_changes_dir(stamp);
        let shots = self.paths.backup_shots_file(stamp);

        let shot_count = if changes.is_dir() {
            materialize_changes_dir(&changes).map(|s| s.len()).unwrap_or(0)
        } else {
            legacy_shot_count(&shots)
        };
        let size = fs_util::tree_size(&changes)
            + fs_util::tree_size(&self.paths.backup_tasks_dir(stamp))
            + fs_util::tree_size(&shots);

        BackupInfo {
            timestamp: taken.map(|t| t.timestamp_millis().max(0) as u64).unwrap_or(0),
            filename: stamp.to_string(),
            created_by: String::from("unknown"),
            shot_count,
            uncompressed_size: size,
            date: taken
                .map(|t| t.format("%Y-%m-%d").to_string())
                .unwrap_or_default(),
        }
    }

    /// Recorded backups, newest first
    pub fn list_backups(&self) -> SyncResult<Vec<BackupInfo>> {
        let mut backups = self.read_metadata()?.backups;
        backups.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(backups)
    }

    fn find_backup(&self, id: &str) -> SyncResult<BackupInfo> {
        self.list_backups()?
            .into_iter()
            .find(|b| b.filename == id || b.timestamp.to_string() == id)
            .ok_or_else(|| SyncError::NotFound(format!("backup {}", id)))
    }

    /// Replaces the live change logs with a backup and makes it win
    ///
    /// `backup_id` is a backup's filename stamp or its epoch-ms timestamp.
    pub async fn restore_backup(&self, backup_id: &str, cancel: &CancelSignal) -> SyncResult<RestoreReport> {
        let _guard = self.ctx.locks().lock(self.paths.job_path()).await;
        let backup = self.find_backup(backup_id)?;
        let source = self.paths.backup_changes_dir(&backup.filename);
        if !source.is_dir() {
            return Err(SyncError::NotFound(format!(
                "change logs of backup {}",
                backup.filename
            )));
        }

        let lock = self.acquire_default_lock(cancel).await?;
        let restore_stamp = paths::backup_stamp(&Local::now());

        let safety_copy = self.save_legacy_shots(&restore_stamp)?;

        let changes_dir = self.paths.changes_dir();
        let staged = sibling(&changes_dir, "staged");
        let restored_at = now_millis();
        let staging = fs_util::copy_dir_recursive(&source, &staged)
            .and_then(|_| restamp_changes_dir(&staged, restored_at));
        let (entries_rewritten, files_rewritten) = match staging {
            Ok(counts) => counts,
            Err(e) => {
                let _ = fs_util::remove_dir_if_exists(&staged);
                return Err(e);
            }
        };
        swap_in_dir(&staged, &changes_dir)?;

        self.restore_legacy_shots(&backup.filename);
        let tasks_restored = self.restore_tasks(&backup.filename);
        let shot_count = materialize_changes_dir(&changes_dir)?.len();

        lock.release()?;

        log::info!(
            "Restored backup {} ({} entries restamped to {})",
            backup.filename,
            entries_rewritten,
            restored_at
        );
        self.sync_log.record(
            SyncEvent::Restore,
            &format!(
                "restored {} entries={} files={} shots={} tasks={}",
                backup.filename, entries_rewritten, files_rewritten, shot_count, tasks_restored
            ),
        );

        Ok(RestoreReport {
            backup,
            restored_at,
            entries_rewritten,
            files_rewritten,
            shot_count,
            tasks_restored,
            safety_copy,
        })
    }

    /// Copies the live `shots.json` to `backups/corrupt_<stamp>.json`
    fn save_legacy_shots(&self, stamp: &str) -> SyncResult<Option<PathBuf>> {
        let live = self.paths.legacy_shots();
        if !live.exists() {
            return Ok(None);
        }
        let target = self.paths.corrupt_shots_file(stamp);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&live, &target)?;
        log::info!("Saved pre-restore shots.json as {}", target.display());
        Ok(Some(target))
    }

    fn restore_legacy_shots(&self, stamp: &str) {
        let source = self.paths.backup_shots_file(stamp);
        if !source.exists() {
            return;
        }
        let result = fs::read(&source)
            .map_err(SyncError::from)
            .and_then(|bytes| fs_util::write_bytes_atomic(&self.paths.legacy_shots(), &bytes));
        if let Err(e) = result {
            log::error!("Restoring legacy shots.json failed: {}", e);
        }
    }

    /// Best-effort replacement of `tasks/`; false if the backup has none or it failed
    fn restore_tasks(&self, stamp: &str) -> bool {
        let source = self.paths.backup_tasks_dir(stamp);
        if !source.is_dir() {
            return false;
        }
        let tasks_dir = self.paths.tasks_dir();
        let staged = sibling(&tasks_dir, "staged");
        let result = fs_util::copy_dir_recursive(&source, &staged)
            .and_then(|_| swap_in_dir(&staged, &tasks_dir));
        match result {
            Ok(()) => true,
            Err(e) => {
                log::error!("Restoring tasks from backup {} failed: {}", stamp, e);
                let _ = fs_util::remove_dir_if_exists(&staged);
                false
            }
        }
    }

    pub async fn evict_old_backups(
        &self,
        retention_days: i64,
        cancel: &CancelSignal,
    ) -> SyncResult<Vec<BackupInfo>> {
        self.evict_old_backups_at(Local::now(), retention_days, cancel)
            .await
    }

    /// Applies the tiered retention policy as of `now`; returns evicted backups
    pub async fn evict_old_backups_at(
        &self,
        now: DateTime<Local>,
        retention_days: i64,
        cancel: &CancelSignal,
    ) -> SyncResult<Vec<BackupInfo>> {
        let _guard = self.ctx.locks().lock(self.paths.job_path()).await;
        let lock = self.acquire_default_lock(cancel).await?;

        let mut metadata = self.load_metadata(true)?;
        let plan = retention::plan_retention(
            &metadata.backups,
            now,
            self.ctx.config().keep_all_days,
            retention_days,
        );

        let mut kept = plan.keep;
        let mut evicted = Vec::new();
        for info in plan.evict {
            match self.delete_backup_files(&info.filename) {
                Ok(()) => evicted.push(info),
                Err(e) => {
                    log::error!("Could not delete backup {}: {}", info.filename, e);
                    kept.push(info);
                }
            }
        }

        kept.sort_by_key(|b| b.timestamp);
        metadata.backups = kept;
        metadata.retention_days = retention_days;
        fs_util::write_json_atomic(&self.paths.backup_metadata(), &metadata)?;
        lock.release()?;

        if !evicted.is_empty() {
            let names: Vec<&str> = evicted.iter().map(|b| b.filename.as_str()).collect();
            log::info!("Evicted {} backup(s): {}", evicted.len(), names.join(", "));
            self.sync_log.record(
                SyncEvent::Evict,
                &format!("retention {} days removed {}", retention_days, names.join(", ")),
            );
        }
        Ok(evicted)
    }

    fn delete_backup_files(&self, stamp: &str) -> SyncResult<()> {
        fs_util::remove_dir_if_exists(&self.paths.backup_changes_dir(stamp))?;
        fs_util::remove_dir_if_exists(&self.paths.backup_tasks_dir(stamp))?;
        fs_util::remove_file_if_exists(&self.paths.backup_shots_file(stamp))
    }

    /// Whether no backup has been recorded for `today` yet
    pub fn should_create_daily_backup_on(&self, today: NaiveDate) -> bool {
        let today = today.format("%Y-%m-%d").to_string();
        match self.read_metadata() {
            Ok(metadata) => metadata.last_backup_date.as_deref() != Some(today.as_str()),
            Err(e) => {
                log::warn!("Backup metadata unreadable: {}", e);
                true
            }
        }
    }

    pub fn should_create_daily_backup(&self) -> bool {
        self.should_create_daily_backup_on(Local::now().date_naive())
    }
}

/// Copies a component directory; a failed copy leaves nothing behind
fn copy_component(source: &Path, target: &Path) -> SyncResult<u64> {
    fs_util::copy_dir_recursive(source, target).map_err(|e| {
        let _ = fs_util::remove_dir_if_exists(target);
        e
    })
}

fn legacy_shot_count(path: &Path) -> usize {
    fs_util::read_json_file::<serde_json::Value>(path)
        .ok()
        .flatten()
        .and_then(|root| root.get("shots").and_then(|s| s.as_array()).map(Vec::len))
        .unwrap_or(0)
}

/// Materialized state of a `changes/` tree (live or inside a backup)
fn materialize_changes_dir(changes_dir: &Path) -> SyncResult<ShotMap> {
    let store = ChangeLogStore::new(changes_dir);
    let device_ids = store.list_device_ids()?;
    let mut entries = store.collect_entries(&device_ids, None).entries;
    materialize::sort_entries(&mut entries);
    let baseline = BootstrapSnapshotStore::new(store.bootstrap_path()).read_bootstrap_snapshot();
    Ok(materialize::materialize(&entries, &baseline))
}

/// Restamps every log entry below `changes_dir`
///
/// The entry deciding each shot's final state gets `now`; every other entry
/// gets `now - 1`. Merging the rewritten logs therefore yields exactly the
/// state they encoded before, and every entry outranks anything older than
/// the restore. Returns `(entries, files)` rewritten.
fn restamp_changes_dir(changes_dir: &Path, now: u64) -> SyncResult<(usize, usize)> {
    let store = ChangeLogStore::new(changes_dir);

    let mut files: Vec<(PathBuf, Vec<ChangeLogEntry>)> = Vec::new();
    for path in store.all_log_files()? {
        match ChangeLogStore::read_log_file(&path) {
            Ok(entries) => files.push((path, entries)),
            Err(e) => log::warn!("Not restamping unreadable log {}: {}", path.display(), e),
        }
    }

    let mut located: Vec<(usize, usize)> = files
        .iter()
        .enumerate()
        .flat_map(|(f, (_, entries))| (0..entries.len()).map(move |i| (f, i)))
        .collect();
    located.sort_by(|a, b| materialize::merge_order(&files[a.0].1[a.1], &files[b.0].1[b.1]));

    let sorted: Vec<ChangeLogEntry> = located
        .iter()
        .map(|&(f, i)| files[f].1[i].clone())
        .collect();
    let winners = materialize::winning_indices(&sorted);

    let older = now.saturating_sub(1);
    for (rank, &(f, i)) in located.iter().enumerate() {
        let stamp = if winners.contains(&rank) { now } else { older };
        files[f].1[i].restamp(stamp);
    }

    for (path, entries) in &files {
        fs_util::write_json_atomic(path, entries)?;
    }

    let bootstrap = BootstrapSnapshotStore::new(store.bootstrap_path());
    if let Some(mut snapshot) = bootstrap.read_snapshot() {
        for shot in snapshot.shots.values_mut() {
            shot.modified_time = now;
        }
        bootstrap.write_snapshot(&snapshot)?;
    }

    Ok((located.len(), files.len()))
}

/// `<dir>.<ulid>.<suffix>` next to `dir`
fn sibling(dir: &Path, suffix: &str) -> PathBuf {
    let name = dir
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("dir");
    dir.with_file_name(format!("{}.{}.{}", name, ulid::Ulid::new(), suffix))
}

/// Moves `staged` into place at `live`, putting the old `live` back on failure
fn swap_in_dir(staged: &Path, live: &Path) -> SyncResult<()> {
    let previous = sibling(live, "previous");
    let had_live = live.exists();

    if had_live {
        fs::rename(live, &previous)?;
    }
    if let Err(e) = fs::rename(staged, live) {
        if had_live {
            if let Err(back) = fs::rename(&previous, live) {
                log::error!(
                    "Could not put {} back after a failed swap: {}",
                    live.display(),
                    back
                );
            }
        }
        return Err(SyncError::Io(e));
    }

    if had_live {
        if let Err(e) = fs_util::remove_dir_if_exists(&previous) {
            log::warn!("Leftover directory {}: {}", previous.display(), e);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archival::ArchivalManager;
    use crate::config::SyncConfig;
    use crate::models::Shot;
    use crate::reader::ReadOptions;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn ctx(device: &str) -> SyncContext {
        SyncContext::new(
            device,
            SyncConfig {
                lock_timeout_secs: 0,
                ..SyncConfig::default()
            },
        )
    }

    fn at(day: u32, hour: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 10, day, hour, 0, 0).single().unwrap()
    }

    fn named(path: &str, name: &str) -> Shot {
        let mut shot = Shot::new(path, "shot");
        shot.display_name = name.to_string();
        shot
    }

    async fn seeded_job(dir: &TempDir) -> (ArchivalManager, BackupManager) {
        let ctx = ctx("dev-a");
        let archival = ArchivalManager::new(&ctx, dir.path());
        let backups = BackupManager::new(&ctx, dir.path());
        archival.record_update(named("sh010", "v1")).await.unwrap();
        archival.record_update(named("sh020", "kept")).await.unwrap();
        (archival, backups)
    }

    #[tokio::test]
    async fn test_create_and_list_backups() {
        let dir = TempDir::new().unwrap();
        let (_, backups) = seeded_job(&dir).await;
        let paths = backups.paths().clone();
        fs::create_dir_all(paths.tasks_dir().join("comp")).unwrap();
        fs::write(paths.tasks_dir().join("comp").join("notes.txt"), "todo").unwrap();
        fs::write(paths.legacy_shots(), r#"{"version": 1, "shots": [{}, {}, {}]}"#).unwrap();

        let first = backups.create_backup_at(at(16, 9), &CancelSignal::never()).await.unwrap();
        assert_eq!(first.filename, "2026-10-16_090000");
        assert_eq!(first.shot_count, 2);
        assert_eq!(first.created_by, "dev-a");
        assert!(first.uncompressed_size > 0);
        assert!(paths.backup_changes_dir(&first.filename).join("device-dev-a.json").exists());
        assert!(paths.backup_tasks_dir(&first.filename).join("comp").join("notes.txt").exists());
        assert!(paths.backup_shots_file(&first.filename).exists());
        assert!(!paths.backup_lock().exists());

        let again = backups.create_backup_at(at(16, 9), &CancelSignal::never()).await.unwrap();
        assert_eq!(again.filename, "2026-10-16_090000-2");

        let later = backups.create_backup_at(at(17, 9), &CancelSignal::never()).await.unwrap();
        let listed: Vec<String> = backups
            .list_backups()
            .unwrap()
            .into_iter()
            .map(|b| b.filename)
            .collect();
        assert_eq!(listed[0], later.filename);
        assert_eq!(listed.len(), 3);

        let metadata = backups.read_metadata().unwrap();
        assert_eq!(metadata.last_backup_date.as_deref(), Some("2026-10-17"));
        assert!(!backups.should_create_daily_backup_on(at(17, 20).date_naive()));
        assert!(backups.should_create_daily_backup_on(at(18, 1).date_naive()));

        let log = fs::read_to_string(paths.sync_log()).unwrap();
        assert!(log.contains("BACKUP created 2026-10-16_090000"));
    }

    #[tokio::test]
    async fn test_components_are_independent() {
        let dir = TempDir::new().unwrap();
        let (_, backups) = seeded_job(&dir).await;
        fs::write(backups.paths().legacy_shots(), "{ broken").unwrap();

        let info = backups.create_backup_at(at(16, 9), &CancelSignal::never()).await.unwrap();
        assert!(!backups.paths().backup_shots_file(&info.filename).exists());
        assert!(!backups.paths().backup_tasks_dir(&info.filename).exists());
        assert!(backups.paths().backup_changes_dir(&info.filename).is_dir());
    }

    #[tokio::test]
    async fn test_empty_job_has_nothing_to_back_up() {
        let dir = TempDir::new().unwrap();
        let backups = BackupManager::new(&ctx("dev-a"), dir.path());

        let result = backups.create_backup_at(at(16, 9), &CancelSignal::never()).await;
        assert!(matches!(result, Err(SyncError::NothingToBackup)));
        assert!(!backups.paths().backup_lock().exists());
        assert!(backups.list_backups().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_backup_refuses_fresh_foreign_lock() {
        let dir = TempDir::new().unwrap();
        let (_, backups) = seeded_job(&dir).await;
        fs::write(backups.paths().backup_lock(), format!("dev-b:{}", now_millis())).unwrap();

        let result = backups.create_backup_at(at(16, 9), &CancelSignal::never()).await;
        assert!(matches!(result, Err(SyncError::LockHeld { .. })));
        assert!(backups.list_backups().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_backup_takes_over_stale_lock() {
        let dir = TempDir::new().unwrap();
        let (_, backups) = seeded_job(&dir).await;
        let stale = now_millis() - 301_000;
        fs::write(backups.paths().backup_lock(), format!("dev-b:{}", stale)).unwrap();

        backups.create_backup_at(at(16, 9), &CancelSignal::never()).await.unwrap();
        assert!(!backups.paths().backup_lock().exists());

        let log = fs::read_to_string(backups.paths().sync_log()).unwrap();
        assert!(log.contains(&format!("LOCK_REMOVED removed abandoned lock \"dev-b:{}\"", stale)));
    }

    #[tokio::test]
    async fn test_corrupt_metadata_keeps_backup_history() {
        let dir = TempDir::new().unwrap();
        let (_, backups) = seeded_job(&dir).await;
        let paths = backups.paths().clone();
        for day in [13, 14, 15] {
            backups.create_backup_at(at(day, 9), &CancelSignal::never()).await.unwrap();
        }

        // Torn write from another device
        let metadata_path = paths.backup_metadata();
        let content = fs::read_to_string(&metadata_path).unwrap();
        fs::write(&metadata_path, &content[..content.len() / 2]).unwrap();

        let listed = backups.list_backups().unwrap();
        assert_eq!(listed.len(), 3);
        assert_eq!(listed[0].filename, "2026-10-15_090000");
        assert_eq!(listed[0].timestamp, at(15, 9).timestamp_millis() as u64);
        assert_eq!(listed[0].shot_count, 2);
        assert!(!backups.should_create_daily_backup_on(at(15, 20).date_naive()));

        backups.create_backup_at(at(16, 9), &CancelSignal::never()).await.unwrap();
        let names: Vec<String> = backups
            .list_backups()
            .unwrap()
            .into_iter()
            .map(|b| b.filename)
            .collect();
        assert_eq!(
            names,
            vec![
                "2026-10-16_090000",
                "2026-10-15_090000",
                "2026-10-14_090000",
                "2026-10-13_090000"
            ]
        );

        let recorded: BackupMetadata = fs_util::read_json_file(&metadata_path).unwrap().unwrap();
        assert_eq!(recorded.backups.len(), 4);
        let set_aside = fs::read_dir(paths.backups_dir())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".corrupt.json"))
            .count();
        assert_eq!(set_aside, 1);
    }

    #[tokio::test]
    async fn test_unrecorded_backup_folder_is_listed_and_evicted() {
        let dir = TempDir::new().unwrap();
        let (_, backups) = seeded_job(&dir).await;
        let paths = backups.paths().clone();
        backups.create_backup_at(at(16, 9), &CancelSignal::never()).await.unwrap();

        // Copied, but the metadata write never happened
        let orphan = "2026-08-01_120000";
        fs_util::copy_dir_recursive(&paths.changes_dir(), &paths.backup_changes_dir(orphan)).unwrap();

        let listed = backups.list_backups().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[1].filename, orphan);
        assert_eq!(listed[1].date, "2026-08-01");
        assert!(backups.restore_backup(orphan, &CancelSignal::never()).await.is_ok());

        let evicted = backups
            .evict_old_backups_at(at(17, 9), 30, &CancelSignal::never())
            .await
            .unwrap();
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].filename, orphan);
        assert!(!paths.backup_changes_dir(orphan).exists());
        assert_eq!(backups.list_backups().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_restore_wins_over_earlier_writes() {
        let dir = TempDir::new().unwrap();
        let (archival, backups) = seeded_job(&dir).await;
        archival.record_delete("sh020").await.unwrap();
        archival.record_update(named("sh020", "back")).await.unwrap();
        let info = backups.create_backup_at(at(16, 9), &CancelSignal::never()).await.unwrap();

        // Another device overwrites a shot after the backup
        let other = ArchivalManager::new(&ctx("dev-b"), dir.path());
        let overwrite = other.record_update(named("sh010", "v2")).await.unwrap();
        fs::write(backups.paths().legacy_shots(), r#"{"version": 1, "shots": []}"#).unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let before = now_millis();
        let report = backups
            .restore_backup(&info.filename, &CancelSignal::never())
            .await
            .unwrap();
        assert!(report.restored_at >= before);
        assert_eq!(report.shot_count, 2);
        assert!(report.safety_copy.as_ref().unwrap().exists());

        for entry in archival.store().read_active_log("dev-a").unwrap() {
            assert!(entry.timestamp + 1 >= report.restored_at);
            if let Some(shot) = &entry.data {
                assert_eq!(shot.modified_time, entry.timestamp);
            }
        }

        // The pre-restore write shows up again late from the other device
        archival
            .store()
            .write_active_log("dev-b", std::slice::from_ref(&overwrite))
            .unwrap();

        let state = archival
            .read_all_change_logs(&ReadOptions::default(), &CancelSignal::never())
            .await
            .unwrap()
            .shots;
        assert_eq!(state["sh010"].display_name, "v1");
        assert_eq!(state["sh020"].display_name, "back");

        let log = fs::read_to_string(backups.paths().sync_log()).unwrap();
        assert!(log.contains("RESTORE restored"));
    }

    #[tokio::test]
    async fn test_restore_by_timestamp_and_tasks() {
        let dir = TempDir::new().unwrap();
        let (_, backups) = seeded_job(&dir).await;
        let tasks = backups.paths().tasks_dir();
        fs::create_dir_all(&tasks).unwrap();
        fs::write(tasks.join("a.txt"), "original").unwrap();
        let info = backups.create_backup_at(at(16, 9), &CancelSignal::never()).await.unwrap();

        fs::write(tasks.join("a.txt"), "changed").unwrap();
        fs::write(tasks.join("b.txt"), "new").unwrap();

        let report = backups
            .restore_backup(&info.timestamp.to_string(), &CancelSignal::never())
            .await
            .unwrap();
        assert!(report.tasks_restored);
        assert!(report.safety_copy.is_none());
        assert_eq!(fs::read_to_string(tasks.join("a.txt")).unwrap(), "original");
        assert!(!tasks.join("b.txt").exists());
    }

    #[tokio::test]
    async fn test_failed_restore_leaves_live_state() {
        let dir = TempDir::new().unwrap();
        let (archival, backups) = seeded_job(&dir).await;
        let paths = backups.paths().clone();
        fs::write(paths.legacy_shots(), r#"{"version": 1, "shots": ["OLD"]}"#).unwrap();
        let info = backups.create_backup_at(at(16, 9), &CancelSignal::never()).await.unwrap();
        assert!(paths.backup_shots_file(&info.filename).exists());

        let live = r#"{"version": 1, "shots": ["LIVE"]}"#;
        fs::write(paths.legacy_shots(), live).unwrap();
        archival.record_update(named("sh030", "after")).await.unwrap();
        let live_log = archival.store().read_active_log("dev-a").unwrap();

        // A file where the backup's archive directory belongs
        fs::write(paths.backup_changes_dir(&info.filename).join("archive"), "x").unwrap();

        let result = backups.restore_backup(&info.filename, &CancelSignal::never()).await;
        assert!(result.is_err());
        assert_eq!(fs::read_to_string(paths.legacy_shots()).unwrap(), live);
        assert_eq!(archival.store().read_active_log("dev-a").unwrap(), live_log);
        assert!(!paths.backup_lock().exists());

        let leftovers = fs::read_dir(paths.ufb_dir())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".staged"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_restore_replaces_legacy_shots() {
        let dir = TempDir::new().unwrap();
        let (_, backups) = seeded_job(&dir).await;
        let paths = backups.paths().clone();
        let old = r#"{"version": 1, "shots": ["OLD"]}"#;
        fs::write(paths.legacy_shots(), old).unwrap();
        let info = backups.create_backup_at(at(16, 9), &CancelSignal::never()).await.unwrap();

        fs::write(paths.legacy_shots(), r#"{"version": 1, "shots": ["LIVE"]}"#).unwrap();
        let report = backups
            .restore_backup(&info.filename, &CancelSignal::never())
            .await
            .unwrap();
        assert_eq!(fs::read_to_string(paths.legacy_shots()).unwrap(), old);
        assert!(fs::read_to_string(report.safety_copy.unwrap())
            .unwrap()
            .contains("LIVE"));
    }

    #[tokio::test]
    async fn test_restore_unknown_backup() {
        let dir = TempDir::new().unwrap();
        let (_, backups) = seeded_job(&dir).await;
        let result = backups
            .restore_backup("1999-01-01_000000", &CancelSignal::never())
            .await;
        assert!(matches!(result, Err(SyncError::NotFound(_))));
    }

    #[test]
    fn test_restamp_keeps_materialized_state() {
        let dir = TempDir::new().unwrap();
        let store = ChangeLogStore::new(dir.path());
        let update = |device: &str, ts: u64, name: &str| {
            let mut shot = named("sh010", name);
            shot.modified_time = ts;
            ChangeLogEntry::update(device, ts, shot)
        };
        store
            .write_active_log("dev-a", &[update("dev-a", 10, "a10"), update("dev-a", 30, "a30")])
            .unwrap();
        store.write_active_log("dev-b", &[update("dev-b", 20, "b20")]).unwrap();
        store
            .write_archive("dev-b", 2026, 1, &[ChangeLogEntry::delete("dev-b", 5, "sh099")])
            .unwrap();
        let names = |state: ShotMap| -> Vec<(String, String)> {
            state
                .into_iter()
                .map(|(path, shot)| (path, shot.display_name))
                .collect()
        };
        let before = names(materialize_changes_dir(dir.path()).unwrap());

        let (entries, files) = restamp_changes_dir(dir.path(), 1_000).unwrap();
        assert_eq!((entries, files), (4, 3));
        assert_eq!(names(materialize_changes_dir(dir.path()).unwrap()), before);

        let a = store.read_active_log("dev-a").unwrap();
        assert_eq!(a[0].timestamp, 999);
        assert_eq!(a[1].timestamp, 1_000);
        assert_eq!(store.read_active_log("dev-b").unwrap()[0].timestamp, 999);
        assert_eq!(store.read_archive("dev-b", 2026, 1).unwrap()[0].timestamp, 1_000);
    }

    #[tokio::test]
    async fn test_evict_applies_retention() {
        let dir = TempDir::new().unwrap();
        let backups = BackupManager::new(&ctx("dev-a"), dir.path());
        let paths = backups.paths().clone();
        let now = Local.with_ymd_and_hms(2026, 10, 13, 12, 0, 0).single().unwrap();

        let mut metadata = BackupMetadata::default();
        for days in [40, 15, 9, 3, 1] {
            let taken = now - chrono::Duration::days(days);
            let stamp = paths::backup_stamp(&taken);
            fs::create_dir_all(paths.backup_changes_dir(&stamp)).unwrap();
            metadata.backups.push(BackupInfo {
                timestamp: taken.timestamp_millis() as u64,
                filename: stamp,
                created_by: "dev-a".to_string(),
                shot_count: 0,
                uncompressed_size: 0,
                date: taken.format("%Y-%m-%d").to_string(),
            });
        }
        fs_util::write_json_atomic(&paths.backup_metadata(), &metadata).unwrap();

        let evicted = backups
            .evict_old_backups_at(now, 30, &CancelSignal::never())
            .await
            .unwrap();

        let gone: Vec<&str> = evicted.iter().map(|b| b.date.as_str()).collect();
        assert_eq!(gone, vec!["2026-09-03", "2026-09-28"]);
        for info in &evicted {
            assert!(!paths.backup_changes_dir(&info.filename).exists());
        }

        let remaining = backups.read_metadata().unwrap();
        assert_eq!(remaining.backups.len(), 3);
        assert_eq!(remaining.retention_days, 30);
        for info in &remaining.backups {
            assert!(paths.backup_changes_dir(&info.filename).is_dir());
        }
    }
}
