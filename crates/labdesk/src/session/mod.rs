//! Session management module.
//!
//! Handles the lifecycle of lab desktop sessions: creation, readiness,
//! inactivity expiry and teardown.

mod error;
mod models;
pub mod reaper;
mod readiness;
mod service;
mod teardown;
mod timers;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{SessionError, SessionResult};
pub use models::{
    PublicEndpoint, Session, SessionStatus, SessionUrls, TerminationOutcome, UserSessionStatus,
};
pub use readiness::{LogMarkerProbe, Readiness, ReadinessError, ReadinessProbe, wait_until_ready};
pub use service::{SessionService, SessionServiceConfig};
pub use teardown::{TeardownPlan, TeardownReport, TeardownStep};
pub use timers::SessionTimers;
