//! Session error types.

use thiserror::Error;

use crate::container::ContainerError;
use crate::ports::PortError;

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Debug, Error)]
pub enum SessionError {
    /// No live session for the user.
    #[error("no active session")]
    NotFound,

    /// Another operation on the user's session is still in flight.
    #[error("session is {0}, try again later")]
    Busy(String),

    /// The host already runs the maximum number of desktops.
    #[error("session capacity reached ({0} sessions)")]
    CapacityExceeded(usize),

    /// No free host ports.
    #[error(transparent)]
    Ports(#[from] PortError),

    /// The engine refused to create or start the container.
    #[error("failed to start desktop: {0}")]
    Admission(#[from] ContainerError),

    /// The desktop did not report readiness in time.
    #[error("desktop not ready after {0}s")]
    ReadinessTimeout(u64),

    /// The desktop reported a startup failure.
    #[error("desktop startup failed: {0}")]
    StartupFailed(String),

    /// Rejected input (e.g. an empty lab id).
    #[error("invalid request: {0}")]
    InvalidInput(String),
}
