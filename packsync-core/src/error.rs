use std::path::PathBuf;

use thiserror::Error;

/// Failure classes of a synchronization run or of server startup.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Missing or invalid trust material / settings. Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The server rejected our credentials, or we could not produce them.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Connection, timeout or unexpected HTTP status.
    #[error("transport error: {0}")]
    Transport(String),

    /// The manifest body could not be decoded or is unsafe to apply.
    #[error("invalid manifest: {0}")]
    Manifest(String),

    /// Downloaded bytes do not hash to what the manifest promised.
    #[error("checksum mismatch for {path:?}: expected {expected}, got {actual}")]
    Integrity { path: PathBuf, expected: String, actual: String },

    /// The host stopped waiting; the run gave up at the next checkpoint.
    #[error("synchronization cancelled")]
    Cancelled,

    #[error("filesystem error at {path:?}: {source}")]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SyncError {
    pub fn fs(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SyncError::Filesystem { path: path.into(), source }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            SyncError::Transport(format!("stalled connection: {e}"))
        } else {
            SyncError::Transport(e.to_string())
        }
    }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
