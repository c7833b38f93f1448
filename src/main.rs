mod cli;
mod error;
mod filesystem;
mod models;
mod services;

use clap::Parser;
use cli::{Cli, Command, JobsCmd};
use error::AppError;
use services::{settings_service, MaintenanceService};
use shot_sync::validate::validate_json;
use shot_sync::{
    cancel_pair, ArchivalManager, BackupManager, CancelSignal, JobPaths, ReadOptions, RetryPolicy,
    Shot, SyncContext,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            eprintln!("{}", e.user_message());
            ExitCode::FAILURE
        }
    }
}

/// Cancellation signal fired by Ctrl-C
fn cancel_on_ctrl_c() -> CancelSignal {
    let (handle, signal) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Ctrl-C received, stopping");
            handle.cancel();
        }
    });
    signal
}

async fn run(cli: Cli) -> Result<(), AppError> {
    let settings_path = cli.config.unwrap_or_else(filesystem::default_settings_path);
    let settings = settings_service::load_sync_settings(&settings_path)?;
    let service = MaintenanceService::new(settings);
    let ctx = service.context().clone();
    let cancel = cancel_on_ctrl_c();

    match cli.cmd {
        Command::Run => {
            let stats = service.run(&cancel).await;
            println!("{:?}", stats);
        }
        Command::Once => {
            let stats = service.run_cycle(&cancel).await;
            println!("{:?}", stats);
            if stats.jobs_failed > 0 {
                return Err(AppError::Other(format!(
                    "{} job(s) failed, see log output",
                    stats.jobs_failed
                )));
            }
        }
        Command::State {
            job,
            expect_device,
            min_timestamp,
            only_expected,
            since,
            json,
        } => {
            let options = ReadOptions {
                expected_device_id: expect_device,
                min_timestamp,
                only_expected_device: only_expected,
                since,
            };
            print_state(&ctx, &job, &options, json, &cancel).await?;
        }
        Command::Update {
            job,
            shot_path,
            shot_type,
            name,
            metadata,
        } => {
            let mut shot = Shot::new(shot_path, shot_type);
            if let Some(name) = name {
                shot.display_name = name;
            }
            if let Some(metadata) = metadata {
                shot.metadata = serde_json::from_str(&metadata)?;
            }
            let entry = archival(&ctx, &job)?.record_update(shot).await?;
            println!("Recorded update of {} at {}", entry.shot_path, entry.timestamp);
        }
        Command::Delete { job, shot_path } => {
            let entry = archival(&ctx, &job)?.record_delete(&shot_path).await?;
            println!("Recorded delete of {} at {}", entry.shot_path, entry.timestamp);
        }
        Command::Archive { job, days } => {
            let days = days.unwrap_or(ctx.config().archive_days_threshold);
            let report = archival(&ctx, &job)?.archive_old_entries(days).await?;
            println!(
                "Archived {} entries into {} month(s), {} remain active",
                report.archived,
                report.months.len(),
                report.remaining
            );
        }
        Command::Archives { job, device } => {
            for info in archival(&ctx, &job)?.get_archive_files(device.as_deref())? {
                println!(
                    "{}\t{:04}-{:02}\t{}\t{}",
                    info.device_id,
                    info.year,
                    info.month,
                    info.size_bytes,
                    info.path.display()
                );
            }
        }
        Command::Snapshot { job } => {
            let snapshot = archival(&ctx, &job)?.create_bootstrap_snapshot(&cancel).await?;
            println!("Bootstrap snapshot written with {} shots", snapshot.shot_count);
        }
        Command::Backup { job } => {
            let info = backups(&ctx, &job)?.create_backup(&cancel).await?;
            println!(
                "Created backup {} ({} shots, {} bytes)",
                info.filename, info.shot_count, info.uncompressed_size
            );
        }
        Command::Backups { job } => {
            for info in backups(&ctx, &job)?.list_backups()? {
                println!(
                    "{}\t{}\t{}\t{} shots\t{} bytes",
                    info.filename, info.date, info.created_by, info.shot_count, info.uncompressed_size
                );
            }
        }
        Command::Restore { job, backup } => {
            let report = backups(&ctx, &job)?.restore_backup(&backup, &cancel).await?;
            println!(
                "Restored {} ({} shots, {} entries restamped)",
                report.backup.filename, report.shot_count, report.entries_rewritten
            );
            if let Some(copy) = report.safety_copy {
                println!("Previous shots.json saved as {}", copy.display());
            }
        }
        Command::Evict {
            job,
            retention_days,
        } => {
            let days = retention_days.unwrap_or(ctx.config().retention_days);
            let evicted = backups(&ctx, &job)?.evict_old_backups(days, &cancel).await?;
            println!("Evicted {} backup(s)", evicted.len());
            for info in evicted {
                println!("  {}", info.filename);
            }
        }
        Command::Validate { job } => {
            let config = ctx.config();
            let result = validate_json(
                &existing_job(&job)?.legacy_shots(),
                &RetryPolicy::linear_seconds(config.validation_max_retries),
                config.max_legacy_shots,
                &cancel,
            )
            .await?;
            println!("{:?}", result);
        }
        Command::Jobs { cmd } => run_jobs_cmd(&settings_path, &service, cmd)?,
    }

    Ok(())
}

fn existing_job(job: &Path) -> Result<JobPaths, AppError> {
    if !job.is_dir() {
        return Err(AppError::NotFound(format!("Job directory {}", job.display())));
    }
    Ok(JobPaths::new(job))
}

fn archival(ctx: &SyncContext, job: &Path) -> Result<ArchivalManager, AppError> {
    existing_job(job)?;
    Ok(ArchivalManager::new(ctx, job))
}

fn backups(ctx: &SyncContext, job: &Path) -> Result<BackupManager, AppError> {
    existing_job(job)?;
    Ok(BackupManager::new(ctx, job))
}

async fn print_state(
    ctx: &SyncContext,
    job: &Path,
    options: &ReadOptions,
    json: bool,
    cancel: &CancelSignal,
) -> Result<(), AppError> {
    let outcome = archival(ctx, job)?
        .read_all_change_logs(options, cancel)
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome.shots)?);
    } else {
        for (path, shot) in &outcome.shots {
            println!(
                "{}\t{}\t{}\t{}",
                path, shot.shot_type, shot.display_name, shot.device_id
            );
        }
    }

    if !outcome.verified {
        log::warn!("Expected write was not visible yet; state may be stale");
    }
    if !outcome.failed_devices.is_empty() {
        log::warn!(
            "Unreadable change logs skipped: {}",
            outcome.failed_devices.join(", ")
        );
    }
    log::info!(
        "{} shots from {} entries across {} device(s), {} attempt(s)",
        outcome.shots.len(),
        outcome.entries_read,
        outcome.devices.len(),
        outcome.attempts
    );
    Ok(())
}

fn run_jobs_cmd(settings_path: &Path, service: &MaintenanceService, cmd: JobsCmd) -> Result<(), AppError> {
    match cmd {
        JobsCmd::List => {
            for job in service.jobs() {
                println!("{}", job.display());
            }
        }
        JobsCmd::Add { job } => {
            let job = absolute(job);
            if !job.is_dir() {
                return Err(AppError::NotFound(format!("Job directory {}", job.display())));
            }
            if settings_service::add_job(settings_path, job.clone())? {
                println!("Added {}", job.display());
            } else {
                println!("{} is already configured", job.display());
            }
        }
        JobsCmd::Remove { job } => {
            if settings_service::remove_job(settings_path, &job)?
                || settings_service::remove_job(settings_path, &absolute(job.clone()))?
            {
                println!("Removed {}", job.display());
            } else {
                return Err(AppError::NotFound(format!("Configured job {}", job.display())));
            }
        }
        JobsCmd::Enable => settings_service::set_sync_enabled(settings_path, true)?,
        JobsCmd::Disable => settings_service::set_sync_enabled(settings_path, false)?,
    }
    Ok(())
}

fn absolute(path: PathBuf) -> PathBuf {
    path.canonicalize().unwrap_or(path)
}
