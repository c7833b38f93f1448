use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "ufb-sync")]
#[command(about = "Cross-device shot tracking: state, archival and backups")]
pub struct Cli {
    /// Settings file (default: ./data/ufb-sync.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Maintain all configured jobs until Ctrl-C
    Run,
    /// Single maintenance pass over all configured jobs
    Once,
    /// Print the merged shot state of a job
    State {
        job: PathBuf,
        /// Wait for a write from this device
        #[arg(long = "expect-device")]
        expect_device: Option<String>,
        /// Write time (epoch ms) expected from --expect-device
        #[arg(long = "min-timestamp", requires = "expect_device")]
        min_timestamp: Option<u64>,
        /// Only read the expected device's logs
        #[arg(long = "only-expected", requires = "expect_device")]
        only_expected: bool,
        /// Ignore entries older than this (epoch ms)
        #[arg(long)]
        since: Option<u64>,
        #[arg(long)]
        json: bool,
    },
    /// Record a shot update from this device
    Update {
        job: PathBuf,
        shot_path: String,
        #[arg(long = "type", default_value = "shot")]
        shot_type: String,
        #[arg(long)]
        name: Option<String>,
        /// Metadata blob as JSON
        #[arg(long)]
        metadata: Option<String>,
    },
    /// Record a shot deletion from this device
    Delete { job: PathBuf, shot_path: String },
    /// Move this device's old entries into monthly archives
    Archive {
        job: PathBuf,
        #[arg(long)]
        days: Option<u32>,
    },
    /// List archive files
    Archives {
        job: PathBuf,
        #[arg(long)]
        device: Option<String>,
    },
    /// Write a fresh bootstrap snapshot
    Snapshot { job: PathBuf },
    /// Back up the job's sync directory
    Backup { job: PathBuf },
    /// List backups, newest first
    Backups { job: PathBuf },
    /// Restore a backup by stamp or timestamp
    Restore { job: PathBuf, backup: String },
    /// Delete backups outside the retention policy
    Evict {
        job: PathBuf,
        #[arg(long = "retention-days")]
        retention_days: Option<i64>,
    },
    /// Check the legacy shots.json
    Validate { job: PathBuf },
    /// Manage the configured job list
    Jobs {
        #[command(subcommand)]
        cmd: JobsCmd,
    },
}

#[derive(Subcommand, Debug)]
pub enum JobsCmd {
    List,
    Add { job: PathBuf },
    Remove { job: PathBuf },
    Enable,
    Disable,
}
