use std::path::PathBuf;

/// Name of the settings file inside the app data directory
pub const SETTINGS_FILE: &str = "ufb-sync.toml";

/// Get the app data directory
pub fn get_app_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

/// Settings file used when `--config` is not given
pub fn default_settings_path() -> PathBuf {
    get_app_data_dir().join(SETTINGS_FILE)
}
