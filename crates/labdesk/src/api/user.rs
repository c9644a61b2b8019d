//! Caller identity.
//!
//! The upstream REST layer authenticates the user and forwards their id in
//! the `X-User-Id` header. Nothing here validates credentials.

use axum::{extract::FromRequestParts, http::request::Parts};

use super::error::ApiError;

pub const USER_ID_HEADER: &str = "x-user-id";

/// The user a request acts for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentUser {
    id: String,
}

impl CurrentUser {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|h| h.to_str().ok())
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ApiError::unauthorized("missing user identity"))?;

        Ok(CurrentUser { id: id.to_string() })
    }
}
