//! Advisory cross-device backup lock
//!
//! `backup.lock` holds `<deviceId>:<timestampMs>`. The file is created
//! exclusively; a lock older than the staleness window, one stamped further
//! in the future than that window, or one that cannot be parsed is treated as
//! abandoned and removed by whoever finds it. Nothing at the OS level
//! enforces the lock.

use crate::error::{SyncError, SyncResult};
use crate::models::now_millis;
use crate::retry::CancelSignal;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Parsed contents of a lock file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHolder {
    pub device_id: String,
    pub acquired_at: u64,
}

impl LockHolder {
    fn to_content(&self) -> String {
        format!("{}:{}", self.device_id, self.acquired_at)
    }

    /// Too old, or stamped further ahead than a skewed clock explains
    fn is_stale(&self, now_ms: u64, stale_after: Duration) -> bool {
        let window = stale_after.as_millis() as u64;
        now_ms.saturating_sub(self.acquired_at) > window
            || self.acquired_at > now_ms.saturating_add(window)
    }

    fn parse(content: &str) -> Option<Self> {
        let (device_id, ts) = content.trim().rsplit_once(':')?;
        if device_id.is_empty() {
            return None;
        }
        Some(Self {
            device_id: device_id.to_string(),
            acquired_at: ts.parse().ok()?,
        })
    }
}

/// Lock timing knobs
#[derive(Debug, Clone, Copy)]
pub struct LockSettings {
    pub stale_after: Duration,
    pub timeout: Duration,
    pub poll_interval: Duration,
}

/// A held backup lock; released on drop if still ours
#[derive(Debug)]
pub struct BackupLock {
    path: PathBuf,
    holder: LockHolder,
    replaced: Option<String>,
    released: bool,
}

impl BackupLock {
    /// Polls until the lock is acquired or `settings.timeout` elapses
    pub async fn acquire(
        path: &Path,
        device_id: &str,
        settings: LockSettings,
        cancel: &CancelSignal,
    ) -> SyncResult<Self> {
        let started = Instant::now();

        loop {
            match Self::try_acquire_at(path, device_id, settings.stale_after, now_millis())? {
                Ok(lock) => return Ok(lock),
                Err(holder) => {
                    if started.elapsed() >= settings.timeout {
                        log::warn!(
                            "Backup lock {} still held by {} after {:?}",
                            path.display(),
                            holder.device_id,
                            settings.timeout
                        );
                        return Err(SyncError::LockHeld {
                            holder: holder.device_id,
                            acquired_at: holder.acquired_at,
                        });
                    }
                    log::debug!(
                        "Backup lock held by {}, retrying in {:?}",
                        holder.device_id,
                        settings.poll_interval
                    );
                    cancel.sleep(settings.poll_interval).await?;
                }
            }
        }
    }

    /// Single acquisition attempt at `now_ms`
    ///
    /// The inner `Err` carries the current holder of a fresh lock.
    pub fn try_acquire_at(
        path: &Path,
        device_id: &str,
        stale_after: Duration,
        now_ms: u64,
    ) -> SyncResult<Result<Self, LockHolder>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut replaced = None;

        // Two passes: a stale lock found on the first is removed, then retried once
        for _ in 0..2 {
            let holder = LockHolder {
                device_id: device_id.to_string(),
                acquired_at: now_ms,
            };
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    file.write_all(holder.to_content().as_bytes())?;
                    file.sync_all()?;
                    log::debug!("Acquired backup lock {}", path.display());
                    return Ok(Ok(Self {
                        path: path.to_path_buf(),
                        holder,
                        replaced,
                        released: false,
                    }));
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(SyncError::Io(e)),
            }

            let content = match fs::read_to_string(path) {
                Ok(content) => content,
                // Released between our create and read
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(SyncError::Io(e)),
            };

            match LockHolder::parse(&content) {
                Some(holder) if !holder.is_stale(now_ms, stale_after) => {
                    return Ok(Err(holder));
                }
                Some(holder) => {
                    log::warn!(
                        "Removing stale backup lock held by {} since {}",
                        holder.device_id,
                        holder.acquired_at
                    );
                }
                None => {
                    log::warn!("Removing unreadable backup lock {}", path.display());
                }
            }

            match remove_if_unchanged(path, &content)? {
                StaleRemoval::Removed => replaced = Some(content.trim().to_string()),
                StaleRemoval::Gone => {}
                StaleRemoval::Renewed(fresh) => return Ok(Err(fresh)),
            }
        }

        // Another device grabbed the lock after we removed the stale one
        let content = fs::read_to_string(path).unwrap_or_default();
        Ok(Err(LockHolder::parse(&content).unwrap_or(LockHolder {
            device_id: String::from("unknown"),
            acquired_at: now_ms,
        })))
    }

    pub fn holder(&self) -> &LockHolder {
        &self.holder
    }

    /// Content of the abandoned lock this acquisition removed, if any
    pub fn replaced(&self) -> Option<&str> {
        self.replaced.as_deref()
    }

    /// Removes the lock file if it still carries our content
    pub fn release(mut self) -> SyncResult<()> {
        self.released = true;
        self.remove_if_ours()
    }

    fn remove_if_ours(&self) -> SyncResult<()> {
        match fs::read_to_string(&self.path) {
            Ok(content) if LockHolder::parse(&content).as_ref() == Some(&self.holder) => {
                fs::remove_file(&self.path)?;
                log::debug!("Released backup lock {}", self.path.display());
                Ok(())
            }
            Ok(_) => {
                log::warn!(
                    "Backup lock {} was taken over by another device, leaving it",
                    self.path.display()
                );
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SyncError::Io(e)),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum StaleRemoval {
    Removed,
    /// Someone else removed it first
    Gone,
    /// Replaced by a fresh lock in the meantime; left in place
    Renewed(LockHolder),
}

/// Removes the lock at `path` only if it still holds `expected`
///
/// The lock is first renamed to a unique name, so a fresh lock written by
/// another device in the meantime is never deleted. Such a lock is moved
/// back.
fn remove_if_unchanged(path: &Path, expected: &str) -> SyncResult<StaleRemoval> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("backup.lock");
    let moved = path.with_file_name(format!("{}.{}.stale", name, ulid::Ulid::new()));

    match fs::rename(path, &moved) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(StaleRemoval::Gone),
        Err(e) => return Err(SyncError::Io(e)),
    }

    let moved_content = fs::read_to_string(&moved)?;
    if moved_content == expected {
        fs::remove_file(&moved)?;
        return Ok(StaleRemoval::Removed);
    }

    log::warn!(
        "Backup lock {} was renewed while being removed, putting it back",
        path.display()
    );
    fs::rename(&moved, path)?;
    let now_ms = now_millis();
    Ok(StaleRemoval::Renewed(LockHolder::parse(&moved_content).unwrap_or(
        LockHolder {
            device_id: String::from("unknown"),
            acquired_at: now_ms,
        },
    )))
}

impl Drop for BackupLock {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.remove_if_ours() {
                log::warn!("Failed to release backup lock {}: {}", self.path.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const STALE: Duration = Duration::from_secs(300);

    fn settings(timeout_ms: u64) -> LockSettings {
        LockSettings {
            stale_after: STALE,
            timeout: Duration::from_millis(timeout_ms),
            poll_interval: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_acquire_writes_holder() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("backup.lock");

        let lock = BackupLock::try_acquire_at(&path, "dev-a", STALE, 1_000)
            .unwrap()
            .unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "dev-a:1000");

        lock.release().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_fresh_lock_blocks_other_device() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("backup.lock");
        fs::write(&path, "dev-b:1000").unwrap();

        let held = BackupLock::try_acquire_at(&path, "dev-a", STALE, 1_000 + 300_000).unwrap();
        let holder = held.unwrap_err();
        assert_eq!(holder.device_id, "dev-b");
        assert_eq!(holder.acquired_at, 1_000);
    }

    #[test]
    fn test_stale_lock_is_taken_over() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("backup.lock");
        fs::write(&path, "dev-b:1000").unwrap();

        let lock = BackupLock::try_acquire_at(&path, "dev-a", STALE, 1_000 + 300_001)
            .unwrap()
            .unwrap();
        assert_eq!(lock.holder().device_id, "dev-a");
        assert_eq!(fs::read_to_string(&path).unwrap(), "dev-a:301001");
    }

    #[test]
    fn test_takeover_reports_replaced_lock() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("backup.lock");
        fs::write(&path, "dev-b:1000").unwrap();

        let lock = BackupLock::try_acquire_at(&path, "dev-a", STALE, 400_000)
            .unwrap()
            .unwrap();
        assert_eq!(lock.replaced(), Some("dev-b:1000"));

        let clean = BackupLock::try_acquire_at(&dir.path().join("other.lock"), "dev-a", STALE, 5)
            .unwrap()
            .unwrap();
        assert_eq!(clean.replaced(), None);
    }

    #[test]
    fn test_future_dated_lock_beyond_window_is_stale() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("backup.lock");
        let now = 1_000_000;

        fs::write(&path, format!("dev-b:{}", now + 10_000)).unwrap();
        let held = BackupLock::try_acquire_at(&path, "dev-a", STALE, now).unwrap();
        assert_eq!(held.unwrap_err().device_id, "dev-b");

        fs::write(&path, format!("dev-b:{}", now + 300_001)).unwrap();
        let lock = BackupLock::try_acquire_at(&path, "dev-a", STALE, now)
            .unwrap()
            .unwrap();
        assert_eq!(lock.holder().device_id, "dev-a");
    }

    #[test]
    fn test_renewed_lock_survives_stale_removal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("backup.lock");
        // dev-c judged "dev-b:1000" stale, but dev-b renewed it meanwhile
        fs::write(&path, "dev-b:900000").unwrap();

        let removal = remove_if_unchanged(&path, "dev-b:1000").unwrap();
        assert_eq!(
            removal,
            StaleRemoval::Renewed(LockHolder {
                device_id: "dev-b".to_string(),
                acquired_at: 900_000,
            })
        );
        assert_eq!(fs::read_to_string(&path).unwrap(), "dev-b:900000");

        let leftovers: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn test_unchanged_stale_lock_is_removed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("backup.lock");
        fs::write(&path, "dev-b:1000").unwrap();

        assert_eq!(remove_if_unchanged(&path, "dev-b:1000").unwrap(), StaleRemoval::Removed);
        assert!(fs::read_dir(dir.path()).unwrap().next().is_none());
        assert_eq!(remove_if_unchanged(&path, "dev-b:1000").unwrap(), StaleRemoval::Gone);
    }

    #[test]
    fn test_garbage_lock_is_removed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("backup.lock");
        fs::write(&path, "no separator here").unwrap();

        assert!(BackupLock::try_acquire_at(&path, "dev-a", STALE, 5)
            .unwrap()
            .is_ok());
    }

    #[test]
    fn test_drop_keeps_foreign_lock() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("backup.lock");

        let lock = BackupLock::try_acquire_at(&path, "dev-a", STALE, 1_000)
            .unwrap()
            .unwrap();
        fs::write(&path, "dev-b:2000").unwrap();
        drop(lock);

        assert_eq!(fs::read_to_string(&path).unwrap(), "dev-b:2000");
    }

    #[tokio::test]
    async fn test_acquire_times_out_on_held_lock() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("backup.lock");
        fs::write(&path, format!("dev-b:{}", now_millis())).unwrap();

        let result = BackupLock::acquire(&path, "dev-a", settings(30), &CancelSignal::never()).await;
        assert!(matches!(result, Err(SyncError::LockHeld { ref holder, .. }) if holder == "dev-b"));
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("backup.lock");
        let first = BackupLock::try_acquire_at(&path, "dev-b", STALE, now_millis())
            .unwrap()
            .unwrap();

        let releaser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            first.release().unwrap();
        });

        let lock = BackupLock::acquire(&path, "dev-a", settings(2_000), &CancelSignal::never())
            .await
            .unwrap();
        releaser.await.unwrap();
        assert_eq!(lock.holder().device_id, "dev-a");
    }
}
