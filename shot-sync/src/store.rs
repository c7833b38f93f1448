//! Per-device append-only change logs
//!
//! Each device writes only `device-<id>.json` in the changes directory; every
//! device reads all of them. Monthly archives live in `changes/archive/`.

use crate::error::{SyncError, SyncResult};
use crate::fs_util;
use crate::models::{ArchiveFileInfo, ChangeLogEntry};
use crate::paths::{self, ARCHIVE_DIR, BOOTSTRAP_FILE};
use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Entries gathered from several devices
#[derive(Debug, Clone, Default)]
pub struct CollectedEntries {
    pub entries: Vec<ChangeLogEntry>,
    /// Devices whose files could not be read or parsed
    pub failed_devices: Vec<String>,
}

/// Reader/writer for the change logs below one `changes/` directory
#[derive(Debug, Clone)]
pub struct ChangeLogStore {
    changes_dir: PathBuf,
}

impl ChangeLogStore {
    /// Store rooted at a `changes/` directory (live or inside a backup)
    pub fn new(changes_dir: impl Into<PathBuf>) -> Self {
        Self {
            changes_dir: changes_dir.into(),
        }
    }

    pub fn changes_dir(&self) -> &Path {
        &self.changes_dir
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.changes_dir.join(ARCHIVE_DIR)
    }

    pub fn bootstrap_path(&self) -> PathBuf {
        self.changes_dir.join(BOOTSTRAP_FILE)
    }

    pub fn active_log_path(&self, device_id: &str) -> PathBuf {
        self.changes_dir.join(paths::active_log_filename(device_id))
    }

    pub fn archive_path(&self, device_id: &str, year: i32, month: u32) -> PathBuf {
        self.archive_dir()
            .join(paths::archive_filename(device_id, year, month))
    }

    /// Reads a log file; a missing file is an empty log
    pub fn read_log_file(path: &Path) -> SyncResult<Vec<ChangeLogEntry>> {
        Ok(fs_util::read_json_file(path)?.unwrap_or_default())
    }

    pub fn read_active_log(&self, device_id: &str) -> SyncResult<Vec<ChangeLogEntry>> {
        Self::read_log_file(&self.active_log_path(device_id))
    }

    pub fn read_archive(&self, device_id: &str, year: i32, month: u32) -> SyncResult<Vec<ChangeLogEntry>> {
        Self::read_log_file(&self.archive_path(device_id, year, month))
    }

    /// All archived entries of a device, oldest month first
    pub fn read_archived_logs(&self, device_id: &str) -> SyncResult<Vec<ChangeLogEntry>> {
        let mut entries = Vec::new();
        for info in self.list_archive_files(Some(device_id))? {
            entries.extend(Self::read_log_file(&info.path)?);
        }
        Ok(entries)
    }

    /// Archived entries followed by the active log
    pub fn read_device_entries(&self, device_id: &str) -> SyncResult<Vec<ChangeLogEntry>> {
        let mut entries = self.read_archived_logs(device_id)?;
        entries.extend(self.read_active_log(device_id)?);
        Ok(entries)
    }

    /// Reads every given device, isolating failures per device
    ///
    /// A device whose files cannot be read contributes nothing and is listed
    /// in `failed_devices`. With `since` set, older entries are dropped.
    pub fn collect_entries<'a, I>(&self, device_ids: I, since: Option<u64>) -> CollectedEntries
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut collected = CollectedEntries::default();

        for device_id in device_ids {
            match self.read_device_entries(device_id) {
                Ok(entries) => {
                    let before = collected.entries.len();
                    collected.entries.extend(
                        entries
                            .into_iter()
                            .filter(|e| since.map_or(true, |min| e.timestamp >= min)),
                    );
                    log::debug!(
                        "Read {} entries from device {}",
                        collected.entries.len() - before,
                        device_id
                    );
                }
                Err(e) => {
                    log::warn!(
                        "Skipping change log of device {}: {}",
                        device_id,
                        e
                    );
                    collected.failed_devices.push(device_id.clone());
                }
            }
        }

        collected
    }

    /// Replaces the device's active log
    pub fn write_active_log(&self, device_id: &str, entries: &[ChangeLogEntry]) -> SyncResult<()> {
        fs_util::write_json_atomic(&self.active_log_path(device_id), entries)
    }

    pub fn write_archive(
        &self,
        device_id: &str,
        year: i32,
        month: u32,
        entries: &[ChangeLogEntry],
    ) -> SyncResult<()> {
        fs_util::write_json_atomic(&self.archive_path(device_id, year, month), entries)
    }

    /// Appends entries to the device's own active log
    pub fn append_entries(&self, device_id: &str, new_entries: &[ChangeLogEntry]) -> SyncResult<()> {
        if let Some(foreign) = new_entries.iter().find(|e| e.device_id != device_id) {
            return Err(SyncError::Other(format!(
                "Device {} cannot append an entry written by {}",
                device_id, foreign.device_id
            )));
        }

        let mut entries = self.read_active_log(device_id)?;
        entries.extend_from_slice(new_entries);
        self.write_active_log(device_id, &entries)
    }

    /// Device ids found in active logs and archives
    pub fn list_device_ids(&self) -> SyncResult<BTreeSet<String>> {
        let mut ids: BTreeSet<String> = list_file_names(&self.changes_dir)?
            .iter()
            .filter_map(|name| paths::parse_active_log_filename(name))
            .collect();

        ids.extend(
            list_file_names(&self.archive_dir())?
                .iter()
                .filter_map(|name| paths::parse_archive_filename(name))
                .map(|(id, _, _)| id),
        );

        Ok(ids)
    }

    /// Archive files, optionally for one device, in chronological order
    pub fn list_archive_files(&self, device_id: Option<&str>) -> SyncResult<Vec<ArchiveFileInfo>> {
        let archive_dir = self.archive_dir();
        let mut files = Vec::new();

        for name in list_file_names(&archive_dir)? {
            let Some((id, year, month)) = paths::parse_archive_filename(&name) else {
                continue;
            };
            if device_id.map_or(false, |wanted| wanted != id) {
                continue;
            }
            let path = archive_dir.join(&name);
            let size_bytes = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            files.push(ArchiveFileInfo {
                device_id: id,
                year,
                month,
                path,
                size_bytes,
            });
        }

        files.sort_by(|a, b| {
            (a.year, a.month, &a.device_id).cmp(&(b.year, b.month, &b.device_id))
        });
        Ok(files)
    }

    /// Every JSON log file (active and archived), for bulk rewrites
    pub fn all_log_files(&self) -> SyncResult<Vec<PathBuf>> {
        let mut files: Vec<PathBuf> = list_file_names(&self.changes_dir)?
            .into_iter()
            .filter(|name| paths::parse_active_log_filename(name).is_some())
            .map(|name| self.changes_dir.join(name))
            .collect();
        files.extend(self.list_archive_files(None)?.into_iter().map(|info| info.path));
        Ok(files)
    }
}

/// Regular file names in `dir`; a missing directory is empty
fn list_file_names(dir: &Path) -> SyncResult<Vec<String>> {
    let read_dir = match fs::read_dir(dir) {
        Ok(read_dir) => read_dir,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(SyncError::Io(e)),
    };

    let mut names = Vec::new();
    for entry in read_dir.filter_map(|entry| entry.ok()) {
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}
