//! Local filesystem backup store.
//!
//! Used for single-host installs and development; the desktop image writes
//! archives into a bind-mounted directory instead of object storage.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use std::path::{Component, Path, PathBuf};
use tokio::fs;

use super::{BackupError, BackupObject, BackupResult, BackupStore};

/// Backup store rooted at a local directory.
#[derive(Debug, Clone)]
pub struct LocalBackupStore {
    /// Base directory for storage.
    base_path: PathBuf,
}

impl LocalBackupStore {
    /// Create a new local store instance.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Get the full path for a key, refusing anything that escapes the base.
    fn full_path(&self, key: &str) -> BackupResult<PathBuf> {
        let relative = Path::new(normalize_key(key));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(BackupError::InvalidKey(key.to_string()));
        }
        Ok(self.base_path.join(relative))
    }
}

/// Normalize a key by removing leading slashes.
fn normalize_key(key: &str) -> &str {
    key.trim_start_matches('/')
}

/// Convert system time to chrono DateTime.
fn system_time_to_chrono(time: std::time::SystemTime) -> Option<DateTime<Utc>> {
    let d = time.duration_since(std::time::UNIX_EPOCH).ok()?;
    DateTime::from_timestamp(d.as_secs() as i64, d.subsec_nanos())
}

#[async_trait]
impl BackupStore for LocalBackupStore {
    fn kind(&self) -> &'static str {
        "local"
    }

    async fn list(&self, prefix: &str) -> BackupResult<Vec<BackupObject>> {
        let dir = self.full_path(prefix)?;

        if !dir.exists() {
            return Ok(vec![]);
        }

        let mut entries = vec![];
        let mut read_dir = fs::read_dir(&dir).await?;

        while let Some(entry) = read_dir.next_entry().await? {
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }

            let key = entry
                .path()
                .strip_prefix(&self.base_path)
                .map(|p| {
                    p.components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/")
                })
                .unwrap_or_else(|_| entry.file_name().to_string_lossy().to_string());

            let mut object = BackupObject::new(key, meta.len());
            if let Some(dt) = meta.modified().ok().and_then(system_time_to_chrono) {
                object = object.with_modified(dt);
            }
            entries.push(object);
        }

        Ok(entries)
    }

    async fn copy(&self, src: &str, dst: &str) -> BackupResult<()> {
        let src_path = self.full_path(src)?;
        let dst_path = self.full_path(dst)?;

        if !src_path.is_file() {
            return Err(BackupError::NotFound(src.to_string()));
        }

        if let Some(parent) = dst_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        fs::copy(&src_path, &dst_path).await?;
        debug!("Copied {} to {}", src_path.display(), dst_path.display());
        Ok(())
    }
}
