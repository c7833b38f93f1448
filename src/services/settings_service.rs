use crate::error::AppError;
use crate::models::SyncSettings;
use shot_sync::fs_util;
use std::path::{Path, PathBuf};

/// Loads the settings, creating them with a fresh device id if needed
///
/// A missing file yields defaults. Whenever the device id is empty a UUID is
/// generated and written back, so this machine keeps its identity.
pub fn load_sync_settings(path: &Path) -> Result<SyncSettings, AppError> {
    let mut settings = match std::fs::read_to_string(path) {
        Ok(text) => toml::from_str::<SyncSettings>(&text)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => SyncSettings::default(),
        Err(e) => return Err(AppError::Filesystem(e)),
    };

    if settings.device_id.trim().is_empty() {
        settings.device_id = uuid::Uuid::new_v4().to_string();
        log::info!(
            "Generated device id {} and stored it in {}",
            settings.device_id,
            path.display()
        );
        save_sync_settings(path, &settings)?;
    }

    Ok(settings)
}

/// Saves the settings atomically
pub fn save_sync_settings(path: &Path, settings: &SyncSettings) -> Result<(), AppError> {
    let text = toml::to_string_pretty(settings)?;
    fs_util::write_bytes_atomic(path, text.as_bytes())?;
    Ok(())
}

/// Adds a job directory; returns false if it was already listed
pub fn add_job(path: &Path, job: PathBuf) -> Result<bool, AppError> {
    let mut settings = load_sync_settings(path)?;
    if settings.jobs.contains(&job) {
        return Ok(false);
    }
    settings.jobs.push(job);
    save_sync_settings(path, &settings)?;
    Ok(true)
}

/// Removes a job directory; returns false if it was not listed
pub fn remove_job(path: &Path, job: &Path) -> Result<bool, AppError> {
    let mut settings = load_sync_settings(path)?;
    let before = settings.jobs.len();
    settings.jobs.retain(|j| j != job);
    if settings.jobs.len() == before {
        return Ok(false);
    }
    save_sync_settings(path, &settings)?;
    Ok(true)
}

/// Enables or disables the maintenance loop
pub fn set_sync_enabled(path: &Path, enabled: bool) -> Result<(), AppError> {
    let mut settings = load_sync_settings(path)?;
    settings.enabled = enabled;
    save_sync_settings(path, &settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_device_id_is_generated_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ufb-sync.toml");

        let first = load_sync_settings(&path).unwrap();
        assert!(uuid::Uuid::parse_str(&first.device_id).is_ok());
        assert!(path.exists());

        let second = load_sync_settings(&path).unwrap();
        assert_eq!(first.device_id, second.device_id);
    }

    #[test]
    fn test_existing_device_id_is_kept() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ufb-sync.toml");
        std::fs::write(&path, "device_id = \"workstation-7\"\n").unwrap();

        assert_eq!(load_sync_settings(&path).unwrap().device_id, "workstation-7");
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ufb-sync.toml");
        std::fs::write(&path, "device_id = [").unwrap();

        assert!(matches!(load_sync_settings(&path), Err(AppError::Config(_))));
    }

    #[test]
    fn test_job_list_changes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ufb-sync.toml");

        assert!(add_job(&path, PathBuf::from("/jobs/a")).unwrap());
        assert!(!add_job(&path, PathBuf::from("/jobs/a")).unwrap());
        assert!(add_job(&path, PathBuf::from("/jobs/b")).unwrap());
        assert!(remove_job(&path, Path::new("/jobs/a")).unwrap());
        assert!(!remove_job(&path, Path::new("/jobs/a")).unwrap());

        set_sync_enabled(&path, false).unwrap();
        let settings = load_sync_settings(&path).unwrap();
        assert_eq!(settings.jobs, vec![PathBuf::from("/jobs/b")]);
        assert!(!settings.enabled);
    }
}
