//! HTTP request handlers.

use axum::{Json, extract::State, http::StatusCode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use super::error::{ApiError, ApiResult};
use super::state::AppState;
use super::user::CurrentUser;
use crate::backup::{BackupError, BackupRecord};
use crate::observability::SystemStatus;
use crate::session::{Session, SessionStatus};

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Identifiers arrive as strings or bare numbers depending on the client.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum IdValue {
    Text(String),
    Number(i64),
}

impl IdValue {
    fn into_string(self) -> String {
        match self {
            IdValue::Text(s) => s,
            IdValue::Number(n) => n.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDesktopRequest {
    #[serde(alias = "lab_id")]
    pub lab_id: IdValue,
}

/// Session as shown to its owner.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub session_id: String,
    pub display_url: String,
    pub web_url: String,
    pub status: SessionStatus,
    pub lab_id: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
}

impl SessionResponse {
    fn from_session(state: &AppState, session: Session) -> Self {
        let urls = state.sessions.urls(&session);
        Self {
            session_id: session.id,
            display_url: urls.display_url,
            web_url: urls.web_url,
            status: session.status,
            lab_id: session.lab_id,
            created_at: session.created_at,
            last_accessed_at: session.last_accessed_at,
        }
    }
}

/// Start (or return) the caller's desktop.
#[instrument(skip(state, request), fields(user_id = %user.id()))]
pub async fn create_desktop(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<CreateDesktopRequest>,
) -> ApiResult<(StatusCode, Json<SessionResponse>)> {
    let lab_id = request.lab_id.into_string();
    let session = state.sessions.create_session(user.id(), &lab_id).await?;
    info!(session_id = %session.id, lab_id = %lab_id, "Desktop ready");

    Ok((
        StatusCode::CREATED,
        Json(SessionResponse::from_session(&state, session)),
    ))
}

#[instrument(skip(state), fields(user_id = %user.id()))]
pub async fn get_desktop(
    State(state): State<AppState>,
    user: CurrentUser,
) -> ApiResult<Json<SessionResponse>> {
    let session = state.sessions.get_session(user.id()).await?;
    Ok(Json(SessionResponse::from_session(&state, session)))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminateResponse {
    pub status: SessionStatus,
    pub data_persisted: bool,
    pub persistence_type: &'static str,
}

#[instrument(skip(state), fields(user_id = %user.id()))]
pub async fn terminate_desktop(
    State(state): State<AppState>,
    user: CurrentUser,
) -> ApiResult<Json<TerminateResponse>> {
    let outcome = state.sessions.terminate_session(user.id()).await?;
    info!(data_persisted = outcome.data_persisted, "Desktop terminated");

    Ok(Json(TerminateResponse {
        status: outcome.status,
        data_persisted: outcome.data_persisted,
        persistence_type: state.backups.persistence_type(),
    }))
}

#[derive(Debug, Serialize)]
pub struct ActionResponse {
    pub success: bool,
    pub message: String,
}

#[instrument(skip(state), fields(user_id = %user.id()))]
pub async fn extend_desktop(
    State(state): State<AppState>,
    user: CurrentUser,
) -> ApiResult<Json<ActionResponse>> {
    state.sessions.extend_session(user.id()).await?;
    let minutes = state.sessions.config().inactivity_timeout.as_secs() / 60;

    Ok(Json(ActionResponse {
        success: true,
        message: format!("Session extended by {} minutes", minutes),
    }))
}

#[derive(Debug, Serialize)]
pub struct BackupEntry {
    pub key: String,
    pub filename: String,
    pub date: Option<DateTime<Utc>>,
    pub size: u64,
}

impl From<BackupRecord> for BackupEntry {
    fn from(record: BackupRecord) -> Self {
        Self {
            key: record.key,
            filename: record.filename,
            date: record.last_modified,
            size: record.size,
        }
    }
}

/// The caller's archives, newest first. An unreachable store yields `[]`.
#[instrument(skip(state), fields(user_id = %user.id()))]
pub async fn list_backups(
    State(state): State<AppState>,
    user: CurrentUser,
) -> Json<Vec<BackupEntry>> {
    let records = state.backups.list_backups(user.id()).await;
    Json(records.into_iter().map(BackupEntry::from).collect())
}

#[derive(Debug, Deserialize)]
pub struct RestoreBackupRequest {
    pub key: String,
}

#[instrument(skip(state, request), fields(user_id = %user.id(), key = %request.key))]
pub async fn restore_backup(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<RestoreBackupRequest>,
) -> ApiResult<Json<ActionResponse>> {
    match state.backups.restore_backup(user.id(), &request.key).await {
        Ok(()) => Ok(Json(ActionResponse {
            success: true,
            message: "Backup restored. It will be loaded on the next desktop start.".to_string(),
        })),
        Err(e @ (BackupError::InvalidKey(_) | BackupError::NotFound(_))) => Err(ApiError::from(e)),
        Err(e) => {
            warn!(error = %e, "Backup restore failed");
            Ok(Json(ActionResponse {
                success: false,
                message: format!("Backup restore failed: {}", e),
            }))
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSessionResponse {
    pub has_session: bool,
    pub is_running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_info: Option<SessionResponse>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub system: SystemStatus,
    pub user_session: UserSessionResponse,
}

/// Host and caller status. Never fails; degraded parts are listed in
/// `system.errors`.
#[instrument(skip(state), fields(user_id = %user.id()))]
pub async fn desktop_status(
    State(state): State<AppState>,
    user: CurrentUser,
) -> Json<StatusResponse> {
    let (system, user_status) = tokio::join!(
        state.status.system_status(&state.sessions),
        state.sessions.session_status(user.id()),
    );

    Json(StatusResponse {
        system,
        user_session: UserSessionResponse {
            has_session: user_status.has_session,
            is_running: user_status.is_running,
            session_info: user_status
                .session
                .map(|s| SessionResponse::from_session(&state, s)),
        },
    })
}
