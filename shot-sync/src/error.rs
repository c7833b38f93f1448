use std::fmt;
use std::path::PathBuf;

/// Error type for change-log, archival and backup operations
#[derive(Debug)]
pub enum SyncError {
    /// Filesystem error
    Io(std::io::Error),
    /// A JSON file could not be parsed or serialized
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
    /// Another device holds a fresh backup lock
    LockHeld { holder: String, acquired_at: u64 },
    /// Resource not found (backup, device log, ...)
    NotFound(String),
    /// The operation was cancelled while waiting
    Cancelled,
    /// None of the backup components could be copied
    NothingToBackup,
    /// General error
    Other(String),
}

/// Result alias used throughout the crate
pub type SyncResult<T> = Result<T, SyncError>;

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::Io(e) => write!(f, "IO error: {}", e),
            SyncError::Json { path, source } => {
                write!(f, "JSON error in {}: {}", path.display(), source)
            }
            SyncError::LockHeld {
                holder,
                acquired_at,
            } => write!(
                f,
                "Backup lock held by {} since {} (epoch ms)",
                holder, acquired_at
            ),
            SyncError::NotFound(msg) => write!(f, "Not found: {}", msg),
            SyncError::Cancelled => write!(f, "Operation cancelled"),
            SyncError::NothingToBackup => write!(f, "No backup component could be copied"),
            SyncError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for SyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SyncError::Io(e) => Some(e),
            SyncError::Json { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Io(err)
    }
}

impl SyncError {
    /// Wraps a serde_json error together with the file it came from
    pub fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        SyncError::Json {
            path: path.into(),
            source,
        }
    }
}
