use crate::error::AppError;
use crate::models::SyncSettings;
use shot_sync::{ArchivalManager, BackupManager, CancelSignal, SyncContext, SyncError};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// What one maintenance pass did for a job
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobReport {
    pub archived_entries: usize,
    pub snapshot_refreshed: bool,
    pub backup_created: Option<String>,
    pub backups_evicted: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceStats {
    pub jobs_ok: usize,
    pub jobs_failed: usize,
    pub archived_entries: usize,
    pub snapshots_refreshed: usize,
    pub backups_created: usize,
    pub backups_evicted: usize,
}

/// Scheduled archival, bootstrap refresh and daily backups for all jobs
pub struct MaintenanceService {
    settings: SyncSettings,
    ctx: SyncContext,
}

impl MaintenanceService {
    pub fn new(settings: SyncSettings) -> Self {
        let ctx = SyncContext::new(settings.device_id.clone(), settings.sync.clone());
        Self { settings, ctx }
    }

    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }

    /// Runs cycles until cancelled or disabled
    ///
    /// A cycle with failures is followed by `retry_delay_secs` instead of the
    /// regular interval.
    pub async fn run(&self, cancel: &CancelSignal) -> MaintenanceStats {
        let mut total = MaintenanceStats::default();

        if !self.settings.enabled {
            log::warn!("Maintenance is disabled in the settings");
            return total;
        }

        log::info!(
            "Starting maintenance of {} job(s) every {} seconds",
            self.settings.jobs.len(),
            self.settings.maintenance_interval_secs
        );

        loop {
            let stats = self.run_cycle(cancel).await;
            log::info!("Maintenance cycle completed: {:?}", stats);
            let failed = stats.jobs_failed > 0;
            total.add(&stats);

            let wait = if failed {
                self.settings.retry_delay_secs
            } else {
                self.settings.maintenance_interval_secs
            };
            if cancel.sleep(Duration::from_secs(wait)).await.is_err() {
                break;
            }
        }

        log::info!("Maintenance stopped");
        total
    }

    /// One pass over every configured job
    pub async fn run_cycle(&self, cancel: &CancelSignal) -> MaintenanceStats {
        let mut stats = MaintenanceStats::default();

        for job in &self.settings.jobs {
            if cancel.is_cancelled() {
                break;
            }
            match self.maintain_job(job, cancel).await {
                Ok(report) => {
                    stats.jobs_ok += 1;
                    stats.archived_entries += report.archived_entries;
                    stats.snapshots_refreshed += usize::from(report.snapshot_refreshed);
                    stats.backups_created += usize::from(report.backup_created.is_some());
                    stats.backups_evicted += report.backups_evicted;
                }
                Err(e) if e.is_cancelled() => break,
                Err(e) => {
                    log::error!("Maintenance of {} failed: {}", job.display(), e);
                    stats.jobs_failed += 1;
                }
            }
        }

        stats
    }

    /// Archive, snapshot refresh, daily backup and retention for one job
    pub async fn maintain_job(&self, job: &Path, cancel: &CancelSignal) -> Result<JobReport, AppError> {
        if !job.is_dir() {
            return Err(AppError::NotFound(format!("Job directory {}", job.display())));
        }

        let config = self.ctx.config();
        let archival = ArchivalManager::new(&self.ctx, job);
        let backups = BackupManager::new(&self.ctx, job);
        let mut report = JobReport::default();

        report.archived_entries = archival
            .archive_old_entries(config.archive_days_threshold)
            .await?
            .archived;

        if !archival.has_recent_bootstrap_snapshot(config.bootstrap_max_age_hours) {
            archival.create_bootstrap_snapshot(cancel).await?;
            report.snapshot_refreshed = true;
        }

        if self.settings.daily_backup && backups.should_create_daily_backup() {
            match backups.create_backup(cancel).await {
                Ok(info) => report.backup_created = Some(info.filename),
                Err(SyncError::NothingToBackup) => {
                    log::info!("Nothing to back up in {}", job.display());
                }
                Err(e) => return Err(e.into()),
            }
            report.backups_evicted = backups
                .evict_old_backups(config.retention_days, cancel)
                .await?
                .len();
        }

        log::debug!("Maintained {}: {:?}", job.display(), report);
        Ok(report)
    }

    pub fn jobs(&self) -> &[PathBuf] {
        &self.settings.jobs
    }
}

impl MaintenanceStats {
    fn add(&mut self, other: &MaintenanceStats) {
        self.jobs_ok += other.jobs_ok;
        self.jobs_failed += other.jobs_failed;
        self.archived_entries += other.archived_entries;
        self.snapshots_refreshed += other.snapshots_refreshed;
        self.backups_created += other.backups_created;
        self.backups_evicted += other.backups_evicted;
    }
}
