//! HTTP API module.
//!
//! REST endpoints for the caller's lab desktop, its backups and host status.

mod error;
mod handlers;
mod routes;
mod state;
mod user;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use routes::create_router;
pub use state::AppState;
pub use user::{CurrentUser, USER_ID_HEADER};
