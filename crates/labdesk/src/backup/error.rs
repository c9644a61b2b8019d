//! Backup store error types.

use thiserror::Error;

/// Result type for backup operations.
pub type BackupResult<T> = Result<T, BackupError>;

/// Errors that can occur while talking to the backup store.
#[derive(Debug, Error)]
pub enum BackupError {
    /// Object not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Key is malformed or outside the caller's scope.
    #[error("invalid backup key: {0}")]
    InvalidKey(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Backend command or service failed.
    #[error("backend error: {0}")]
    Backend(String),

    /// Backend output could not be understood.
    #[error("failed to parse backend output: {0}")]
    Parse(String),
}
