//! Session identity extraction.
//!
//! HTTP requests name their session in the `x-session-id` header. Issuing
//! session ids is left to whatever sits in front of this server.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use driftline_types::SessionId;

use crate::error::ApiError;

/// Header carrying the caller's session id.
pub const SESSION_HEADER: &str = "x-session-id";

/// The session a request belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Session(pub SessionId);

impl<S: Send + Sync> FromRequestParts<S> for Session {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(SESSION_HEADER)
            .ok_or(ApiError::MissingSession)?;
        let text = value
            .to_str()
            .map_err(|e| ApiError::InvalidSession(e.to_string()))?;
        parse_session(text).map(Self)
    }
}

/// Parse a session id from text.
///
/// # Errors
///
/// Returns [`ApiError::InvalidSession`] if `text` is not a UUID.
pub fn parse_session(text: &str) -> Result<SessionId, ApiError> {
    text.parse::<SessionId>()
        .map_err(|e| ApiError::InvalidSession(format!("{text:?}: {e}")))
}
