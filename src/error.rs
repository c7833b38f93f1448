use shot_sync::SyncError;
use std::fmt;

/// Central error type of the maintenance tool
#[derive(Debug)]
pub enum AppError {
    /// Error from the sync engine
    Sync(SyncError),
    /// Filesystem error
    Filesystem(std::io::Error),
    /// Settings file could not be parsed or written
    Config(String),
    /// Validation error (e.g. invalid inputs)
    Validation(String),
    /// Resource not found
    NotFound(String),
    /// General error
    Other(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AppError::Sync(e) => write!(f, "Sync error: {}", e),
            AppError::Filesystem(e) => write!(f, "Filesystem error: {}", e),
            AppError::Config(msg) => write!(f, "Configuration error: {}", msg),
            AppError::Validation(msg) => write!(f, "Validation error: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AppError::Sync(e) => Some(e),
            AppError::Filesystem(e) => Some(e),
            _ => None,
        }
    }
}

impl From<SyncError> for AppError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::Io(io) => AppError::Filesystem(io),
            other => AppError::Sync(other),
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        AppError::Filesystem(e)
    }
}

impl From<toml::de::Error> for AppError {
    fn from(e: toml::de::Error) -> Self {
        AppError::Config(e.to_string())
    }
}

impl From<toml::ser::Error> for AppError {
    fn from(e: toml::ser::Error) -> Self {
        AppError::Config(e.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::Validation(e.to_string())
    }
}

/// Short messages for terminal output
impl AppError {
    pub fn user_message(&self) -> String {
        match self {
            AppError::Sync(SyncError::LockHeld { holder, .. }) => format!(
                "Another device ({}) is running a backup. Try again in a moment.",
                holder
            ),
            AppError::Sync(SyncError::NothingToBackup) => {
                "Nothing to back up in this job yet.".to_string()
            }
            AppError::Sync(SyncError::Cancelled) => "Cancelled.".to_string(),
            AppError::Sync(SyncError::NotFound(msg)) => format!("{} was not found.", msg),
            AppError::Sync(e) => format!("Sync failed: {}", e),
            AppError::Filesystem(_) => {
                "Error accessing files. Please check the job path and permissions.".to_string()
            }
            AppError::Config(msg) => format!("Invalid settings file: {}", msg),
            AppError::Validation(msg) => msg.clone(),
            AppError::NotFound(msg) => format!("{} was not found.", msg),
            AppError::Other(msg) => msg.clone(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, AppError::Sync(SyncError::Cancelled))
    }
}
