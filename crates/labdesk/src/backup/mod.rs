//! Per-user backup archives.
//!
//! Desktops upload an archive of the user's home directory when they receive
//! the shutdown signal. This module lists those archives and copies a chosen
//! one into the user's "latest" slot, which the next desktop restores from.

mod aws_cli;
mod error;
mod local;
mod store;

pub use aws_cli::AwsCliBackupStore;
pub use error::{BackupError, BackupResult};
pub use local::LocalBackupStore;
pub use store::{BackupObject, BackupStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A backup archive as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub key: String,
    pub filename: String,
    pub last_modified: Option<DateTime<Utc>>,
    pub size: u64,
}

/// Key layout of the backup store.
#[derive(Debug, Clone)]
pub struct BackupLayout {
    /// Root prefix under which every user has a folder.
    pub prefix: String,
    /// Object name of the slot restored on the next start.
    pub latest_name: String,
    /// Maximum number of archives returned by a listing.
    pub max_listed: usize,
}

impl BackupLayout {
    /// Prefix all of a user's archives live under, with a trailing `/`.
    pub fn user_prefix(&self, user_id: &str) -> String {
        let root = self.prefix.trim_matches('/');
        let user = encode_user_segment(user_id);
        if root.is_empty() {
            format!("{}/", user)
        } else {
            format!("{}/{}/", root, user)
        }
    }

    /// Key of the slot the next desktop restores from.
    pub fn latest_key(&self, user_id: &str) -> String {
        format!("{}{}", self.user_prefix(user_id), self.latest_name)
    }
}

/// Reversible encoding of a user id into one key segment. Distinct ids always
/// get distinct segments, and the result never contains `/` or `..`.
fn encode_user_segment(user_id: &str) -> String {
    urlencoding::encode(user_id).replace('.', "%2E")
}

impl Default for BackupLayout {
    fn default() -> Self {
        Self {
            prefix: "backups".to_string(),
            latest_name: "latest.tar.gz".to_string(),
            max_listed: 10,
        }
    }
}

/// Read-mostly client over a [`BackupStore`].
#[derive(Clone)]
pub struct BackupClient {
    store: Arc<dyn BackupStore>,
    layout: BackupLayout,
}

impl BackupClient {
    pub fn new(store: Arc<dyn BackupStore>, layout: BackupLayout) -> Self {
        Self { store, layout }
    }

    /// Backend name reported as `persistenceType`.
    pub fn persistence_type(&self) -> &'static str {
        self.store.kind()
    }

    pub fn layout(&self) -> &BackupLayout {
        &self.layout
    }

    pub fn user_prefix(&self, user_id: &str) -> String {
        self.layout.user_prefix(user_id)
    }

    pub fn latest_key(&self, user_id: &str) -> String {
        self.layout.latest_key(user_id)
    }

    /// List a user's archives, newest first, without the latest slot.
    pub async fn try_list_backups(&self, user_id: &str) -> BackupResult<Vec<BackupRecord>> {
        let prefix = self.user_prefix(user_id);
        let objects = self.store.list(&prefix).await?;

        let mut records: Vec<BackupRecord> = objects
            .into_iter()
            .filter(|obj| obj.filename() != self.layout.latest_name)
            .filter(|obj| obj.key.starts_with(&prefix))
            .map(|obj| BackupRecord {
                filename: obj.filename().to_string(),
                key: obj.key,
                last_modified: obj.last_modified,
                size: obj.size,
            })
            .collect();

        // Newest first; undated objects sink to the end.
        records.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
        records.truncate(self.layout.max_listed);
        Ok(records)
    }

    /// Like [`Self::try_list_backups`], but a store failure yields an empty list.
    pub async fn list_backups(&self, user_id: &str) -> Vec<BackupRecord> {
        match self.try_list_backups(user_id).await {
            Ok(records) => records,
            Err(e) => {
                log::warn!("Failed to list backups for user {}: {}", user_id, e);
                Vec::new()
            }
        }
    }

    /// Copy one of the user's archives into their latest slot.
    pub async fn restore_backup(&self, user_id: &str, key: &str) -> BackupResult<()> {
        let prefix = self.user_prefix(user_id);
        let latest = self.latest_key(user_id);

        let relative = key.strip_prefix(&prefix).unwrap_or("");
        if relative.is_empty() || relative.contains('/') || relative.contains("..") {
            return Err(BackupError::InvalidKey(key.to_string()));
        }
        if key == latest {
            return Err(BackupError::InvalidKey(key.to_string()));
        }

        self.store.copy(key, &latest).await?;
        log::info!("Restored backup {} for user {}", key, user_id);
        Ok(())
    }
}
