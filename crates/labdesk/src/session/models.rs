//! Session data models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ports::PortLease;

/// Session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Container is being created or is waiting for readiness.
    Starting,
    /// Desktop is ready for use.
    Running,
    /// Teardown in progress.
    Terminating,
    /// Teardown finished. Never stored in the registry.
    Terminated,
}

impl SessionStatus {
    /// Whether another operation must wait for this one to finish.
    pub fn is_transitional(&self) -> bool {
        matches!(self, SessionStatus::Starting | SessionStatus::Terminating)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Starting => write!(f, "starting"),
            SessionStatus::Running => write!(f, "running"),
            SessionStatus::Terminating => write!(f, "terminating"),
            SessionStatus::Terminated => write!(f, "terminated"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "starting" => Ok(SessionStatus::Starting),
            "running" => Ok(SessionStatus::Running),
            "terminating" => Ok(SessionStatus::Terminating),
            "terminated" => Ok(SessionStatus::Terminated),
            _ => Err(format!("unknown session status: {}", s)),
        }
    }
}

/// A lab desktop session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Unique session ID (UUID v4).
    pub id: String,
    /// Owning user. At most one live session per user.
    pub user_id: String,
    /// Lab the desktop was started for.
    pub lab_id: String,
    /// Engine container ID (set once the container is created).
    pub container_id: Option<String>,
    /// Deterministic container name.
    pub container_name: String,
    /// Host port of the remote-display service.
    pub display_port: u16,
    /// Host port of the browser proxy.
    pub proxy_port: u16,
    /// Current session status.
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    /// Refreshed by extend calls; drives idle expiry.
    pub last_accessed_at: DateTime<Utc>,
}

impl Session {
    pub fn ports(&self) -> PortLease {
        PortLease {
            display: self.display_port,
            proxy: self.proxy_port,
        }
    }

    /// The handle used to address the container: ID when known, otherwise name.
    pub fn container_ref(&self) -> &str {
        self.container_id.as_deref().unwrap_or(&self.container_name)
    }

    /// Whether the session has been idle for longer than `window` at `now`.
    pub fn is_idle(&self, now: DateTime<Utc>, window: chrono::Duration) -> bool {
        now.signed_duration_since(self.last_accessed_at) > window
    }
}

/// How clients reach a running desktop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUrls {
    /// Direct remote-display URL (`vnc://host:port`).
    pub display_url: String,
    /// Browser URL served by the proxy.
    pub web_url: String,
}

/// Public endpoint settings used to build [`SessionUrls`].
#[derive(Debug, Clone)]
pub struct PublicEndpoint {
    pub host: String,
    pub scheme: String,
    pub web_path: String,
}

impl Default for PublicEndpoint {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            scheme: "http".to_string(),
            web_path: "/vnc.html".to_string(),
        }
    }
}

impl PublicEndpoint {
    pub fn urls_for(&self, session: &Session) -> SessionUrls {
        let path = if self.web_path.starts_with('/') || self.web_path.is_empty() {
            self.web_path.clone()
        } else {
            format!("/{}", self.web_path)
        };
        SessionUrls {
            display_url: format!("vnc://{}:{}", self.host, session.display_port),
            web_url: format!(
                "{}://{}:{}{}",
                self.scheme, self.host, session.proxy_port, path
            ),
        }
    }
}

/// Result of a termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminationOutcome {
    pub status: SessionStatus,
    /// The shutdown signal reached the desktop, so it had the chance to
    /// upload its backup.
    pub data_persisted: bool,
}

/// Snapshot for the status endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct UserSessionStatus {
    pub has_session: bool,
    pub is_running: bool,
    pub session: Option<Session>,
}
