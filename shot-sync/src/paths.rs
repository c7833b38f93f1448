/// Path layout of the shared sync directory inside a job
///
/// Directory structure:
/// ```text
/// <job>/.ufb/
/// ├── changes/
/// │   ├── device-<uuid>.json                  # active log (single writer)
/// │   ├── bootstrap-snapshot.json             # cached materialized state
/// │   └── archive/
/// │       └── device-<uuid>-YYYY-MM.json      # monthly archive
/// ├── tasks/                                  # manual task folders
/// ├── backups/
/// │   ├── backup_metadata.json
/// │   ├── changes_<YYYY-MM-DD_HHMMSS>/
/// │   ├── tasks_<YYYY-MM-DD_HHMMSS>/
/// │   └── shots_<YYYY-MM-DD_HHMMSS>.json      # legacy shots.json copy
/// ├── shots.json                              # legacy, read-only
/// ├── backup.lock                             # "<deviceId>:<timestampMs>"
/// └── sync.log
/// ```
use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use std::path::{Path, PathBuf};

/// Hidden sync directory under each job
pub const UFB_DIR: &str = ".ufb";

/// Active change logs
pub const CHANGES_DIR: &str = "changes";

/// Monthly archives (below `changes/`)
pub const ARCHIVE_DIR: &str = "archive";

/// Bootstrap snapshot file (below `changes/`)
pub const BOOTSTRAP_FILE: &str = "bootstrap-snapshot.json";

/// Manual task folders
pub const TASKS_DIR: &str = "tasks";

/// Backup root
pub const BACKUPS_DIR: &str = "backups";

/// Backup bookkeeping file (below `backups/`)
pub const BACKUP_METADATA_FILE: &str = "backup_metadata.json";

/// Legacy state file
pub const LEGACY_SHOTS_FILE: &str = "shots.json";

/// Advisory backup lock
pub const BACKUP_LOCK_FILE: &str = "backup.lock";

/// Human-readable event log
pub const SYNC_LOG_FILE: &str = "sync.log";

const DEVICE_PREFIX: &str = "device-";
const JSON_SUFFIX: &str = ".json";

/// Resolved paths for one job directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPaths {
    job_path: PathBuf,
    ufb_dir: PathBuf,
}

impl JobPaths {
    pub fn new(job_path: impl Into<PathBuf>) -> Self {
        let job_path = job_path.into();
        let ufb_dir = job_path.join(UFB_DIR);
        Self { job_path, ufb_dir }
    }

    pub fn job_path(&self) -> &Path {
        &self.job_path
    }

    pub fn ufb_dir(&self) -> &Path {
        &self.ufb_dir
    }

    pub fn changes_dir(&self) -> PathBuf {
        self.ufb_dir.join(CHANGES_DIR)
    }

    pub fn tasks_dir(&self) -> PathBuf {
        self.ufb_dir.join(TASKS_DIR)
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.ufb_dir.join(BACKUPS_DIR)
    }

    pub fn backup_metadata(&self) -> PathBuf {
        self.backups_dir().join(BACKUP_METADATA_FILE)
    }

    pub fn backup_changes_dir(&self, stamp: &str) -> PathBuf {
        self.backups_dir().join(format!("changes_{}", stamp))
    }

    pub fn backup_tasks_dir(&self, stamp: &str) -> PathBuf {
        self.backups_dir().join(format!("tasks_{}", stamp))
    }

    pub fn backup_shots_file(&self, stamp: &str) -> PathBuf {
        self.backups_dir().join(format!("shots_{}.json", stamp))
    }

    /// Safety copy of the legacy file taken before a restore overwrites it
    pub fn corrupt_shots_file(&self, stamp: &str) -> PathBuf {
        self.backups_dir().join(format!("corrupt_{}.json", stamp))
    }

    pub fn legacy_shots(&self) -> PathBuf {
        self.ufb_dir.join(LEGACY_SHOTS_FILE)
    }

    pub fn backup_lock(&self) -> PathBuf {
        self.ufb_dir.join(BACKUP_LOCK_FILE)
    }

    pub fn sync_log(&self) -> PathBuf {
        self.ufb_dir.join(SYNC_LOG_FILE)
    }
}

/// `device-<id>.json`
pub fn active_log_filename(device_id: &str) -> String {
    format!("{}{}{}", DEVICE_PREFIX, device_id, JSON_SUFFIX)
}

/// `device-<id>-YYYY-MM.json`
pub fn archive_filename(device_id: &str, year: i32, month: u32) -> String {
    format!(
        "{}{}-{:04}-{:02}{}",
        DEVICE_PREFIX, device_id, year, month, JSON_SUFFIX
    )
}

/// Parses `device-<id>.json`; archive names are rejected
pub fn parse_active_log_filename(name: &str) -> Option<String> {
    if parse_archive_filename(name).is_some() {
        return None;
    }
    let id = name.strip_prefix(DEVICE_PREFIX)?.strip_suffix(JSON_SUFFIX)?;
    if id.is_empty() {
        return None;
    }
    Some(id.to_string())
}

/// Parses `device-<id>-YYYY-MM.json` into `(id, year, month)`
pub fn parse_archive_filename(name: &str) -> Option<(String, i32, u32)> {
    let rest = name.strip_prefix(DEVICE_PREFIX)?.strip_suffix(JSON_SUFFIX)?;
    // "-YYYY-MM" tail
    if rest.len() < 9 || !rest.is_char_boundary(rest.len() - 8) {
        return None;
    }
    let (id, tail) = rest.split_at(rest.len() - 8);
    let bytes = tail.as_bytes();
    if bytes[0] != b'-' || bytes[5] != b'-' {
        return None;
    }
    let year_str = &tail[1..5];
    let month_str = &tail[6..8];
    if !year_str.bytes().all(|b| b.is_ascii_digit()) || !month_str.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    let year: i32 = year_str.parse().ok()?;
    let month: u32 = month_str.parse().ok()?;
    if !(1..=12).contains(&month) || id.is_empty() {
        return None;
    }
    Some((id.to_string(), year, month))
}

const STAMP_FORMAT: &str = "%Y-%m-%d_%H%M%S";
const STAMP_LEN: usize = 17;

/// Backup stamp for folder names: `YYYY-MM-DD_HHMMSS`
pub fn backup_stamp(at: &DateTime<Local>) -> String {
    at.format(STAMP_FORMAT).to_string()
}

/// Local time encoded in a stamp, ignoring a `-N` collision suffix
pub fn parse_backup_stamp(stamp: &str) -> Option<DateTime<Local>> {
    let base = stamp.get(..STAMP_LEN)?;
    let rest = &stamp[STAMP_LEN..];
    if !rest.is_empty() && !rest.starts_with('-') {
        return None;
    }
    let naive = NaiveDateTime::parse_from_str(base, STAMP_FORMAT).ok()?;
    Local.from_local_datetime(&naive).earliest()
}

/// Stamp of a backup component name (`changes_<s>`, `tasks_<s>` or `shots_<s>.json`)
pub fn parse_backup_component(name: &str) -> Option<String> {
    let stamp = name
        .strip_prefix("changes_")
        .or_else(|| name.strip_prefix("tasks_"))
        .or_else(|| name.strip_prefix("shots_").and_then(|s| s.strip_suffix(JSON_SUFFIX)))?;
    parse_backup_stamp(stamp)?;
    Some(stamp.to_string())
}
