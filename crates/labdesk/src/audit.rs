//! Audit trail for session lifecycle events.
//!
//! The audit trail is a record for operators, never the source of truth for
//! liveness. Write failures are swallowed.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::session::Session;

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub timestamp: String,
    pub event: String,
    pub user_id: String,
    pub session_id: String,
    pub lab_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    pub container_name: String,
    pub display_port: u16,
    pub proxy_port: u16,
    pub status: String,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_persisted: Option<bool>,
}

impl AuditEvent {
    fn from_session(event: &str, session: &Session, data_persisted: Option<bool>) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            event: event.to_string(),
            user_id: session.user_id.clone(),
            session_id: session.id.clone(),
            lab_id: session.lab_id.clone(),
            container_id: session.container_id.clone(),
            container_name: session.container_name.clone(),
            display_port: session.display_port,
            proxy_port: session.proxy_port,
            status: session.status.to_string(),
            created_at: session
                .created_at
                .to_rfc3339_opts(SecondsFormat::Secs, true),
            data_persisted,
        }
    }
}

/// Receives create/terminate events.
#[async_trait]
pub trait SessionAuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent);

    async fn session_created(&self, session: &Session) {
        self.record(AuditEvent::from_session("session_created", session, None))
            .await;
    }

    async fn session_terminated(&self, session: &Session, data_persisted: bool) {
        self.record(AuditEvent::from_session(
            "session_terminated",
            session,
            Some(data_persisted),
        ))
        .await;
    }
}

/// Writes events as structured log lines.
#[derive(Debug, Default, Clone)]
pub struct LogAuditSink;

#[async_trait]
impl SessionAuditSink for LogAuditSink {
    async fn record(&self, event: AuditEvent) {
        match serde_json::to_string(&event) {
            Ok(line) => log::info!(target: "labdesk::audit", "{}", line),
            Err(e) => log::warn!("Failed to serialize audit event: {}", e),
        }
    }
}

/// Appends events to a JSONL file.
#[derive(Clone)]
pub struct AuditLogger {
    file: Arc<Mutex<File>>,
    path: PathBuf,
}

impl AuditLogger {
    pub async fn new(path: PathBuf) -> Result<Self> {
        ensure_parent_dir(&path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("opening audit log file {}", path.display()))?;
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write_event(&self, event: &AuditEvent) {
        let Ok(mut line) = serde_json::to_string(event) else {
            return;
        };
        line.push('\n');
        let mut file = self.file.lock().await;
        if let Err(e) = file.write_all(line.as_bytes()).await {
            log::warn!("Failed to write audit event to {}: {}", self.path.display(), e);
            return;
        }
        if let Err(e) = file.flush().await {
            log::warn!("Failed to flush audit log {}: {}", self.path.display(), e);
        }
    }
}

#[async_trait]
impl SessionAuditSink for AuditLogger {
    async fn record(&self, event: AuditEvent) {
        self.write_event(&event).await;
    }
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating audit log directory {}", parent.display()))?;
    }
    Ok(())
}
