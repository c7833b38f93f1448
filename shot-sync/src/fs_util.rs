//! File helpers shared by the log store, snapshot store and backups
//!
//! Every JSON rewrite goes through [`write_json_atomic`]: the payload lands in
//! a uniquely named temporary file next to the target, is fsynced and then
//! renamed over it. Readers on other devices therefore see either the old or
//! the new file, never a torn one.

use crate::error::{SyncError, SyncResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::Path;
use walkdir::WalkDir;

/// Suffix of in-flight temporary files; skipped when copying or scanning
pub const TMP_SUFFIX: &str = ".tmp";

/// Reads and parses a JSON file; `Ok(None)` if it does not exist or is blank
pub fn read_json_file<T: DeserializeOwned>(path: &Path) -> SyncResult<Option<T>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(SyncError::Io(e)),
    };

    if content.trim().is_empty() {
        return Ok(None);
    }

    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| SyncError::json(path, e))
}

/// Serializes `value` and atomically replaces `path` with it
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> SyncResult<()> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| SyncError::json(path, e))?;
    write_bytes_atomic(path, &bytes)
}

/// Writes `bytes` to a temp file, fsyncs it and renames it over `path`
pub fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> SyncResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| SyncError::Other(format!("No parent directory for {}", path.display())))?;
    fs::create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| SyncError::Other(format!("Invalid file name: {}", path.display())))?;
    let tmp_path = parent.join(format!(
        "{}.{}{}",
        file_name,
        ulid::Ulid::new(),
        TMP_SUFFIX
    ));

    let result = (|| -> SyncResult<()> {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.flush()?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp_path, path)?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
        return result;
    }

    sync_dir(parent);
    Ok(())
}

/// Flushes directory metadata so the rename is durable (no-op where unsupported)
fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    {
        if let Ok(handle) = fs::File::open(dir) {
            if let Err(e) = handle.sync_all() {
                log::debug!("fsync of directory {} failed: {}", dir.display(), e);
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = dir;
    }
}

/// Recursively copies `src` into `dst`, skipping temp files
///
/// Returns the number of bytes copied.
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> SyncResult<u64> {
    if !src.is_dir() {
        return Err(SyncError::NotFound(format!(
            "Directory {} does not exist",
            src.display()
        )));
    }

    fs::create_dir_all(dst)?;
    let mut copied = 0u64;

    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(|e| SyncError::Other(format!("Walk failed: {}", e)))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| SyncError::Other(format!("Path outside of copy root: {}", e)))?;
        let target = dst.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if is_temp_file(entry.path()) {
                continue;
            }
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            copied += fs::copy(entry.path(), &target)?;
        }
    }

    Ok(copied)
}

/// Total bytes of the regular files at or below `path`; unreadable entries count as 0
pub fn tree_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}

/// Removes a directory tree; absence is not an error
pub fn remove_dir_if_exists(path: &Path) -> SyncResult<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SyncError::Io(e)),
    }
}

/// Removes a file; absence is not an error
pub fn remove_file_if_exists(path: &Path) -> SyncResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SyncError::Io(e)),
    }
}

pub fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.ends_with(TMP_SUFFIX))
        .unwrap_or(false)
}
