//! Backup store trait definitions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::BackupResult;

/// An object in the backup store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupObject {
    /// Full key, `/` separated.
    pub key: String,
    /// Size in bytes.
    pub size: u64,
    /// Last modified time.
    pub last_modified: Option<DateTime<Utc>>,
}

impl BackupObject {
    pub fn new(key: impl Into<String>, size: u64) -> Self {
        Self {
            key: key.into(),
            size,
            last_modified: None,
        }
    }

    /// Set the modified time.
    pub fn with_modified(mut self, time: DateTime<Utc>) -> Self {
        self.last_modified = Some(time);
        self
    }

    /// Last path segment of the key.
    pub fn filename(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}

/// Durable store holding per-user backup archives.
///
/// Archives are written by the desktop itself on shutdown; the orchestrator
/// only lists them and copies one into the restore slot.
#[async_trait]
pub trait BackupStore: Send + Sync {
    /// Short backend name reported to clients (`s3`, `local`).
    fn kind(&self) -> &'static str;

    /// List objects directly under `prefix`.
    async fn list(&self, prefix: &str) -> BackupResult<Vec<BackupObject>>;

    /// Copy an object to another key in the same store.
    async fn copy(&self, src: &str, dst: &str) -> BackupResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_object_filename() {
        let obj = BackupObject::new("backups/7/2024-05-01.tar.gz", 10);
        assert_eq!(obj.filename(), "2024-05-01.tar.gz");
        assert_eq!(BackupObject::new("plain", 0).filename(), "plain");
    }
}
