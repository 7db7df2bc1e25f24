//! Error types for the Driftline HTTP layer.
//!
//! [`ApiError`] unifies request failures into a single enum that converts
//! into an Axum HTTP response with a `{"error", "status"}` JSON body via
//! its [`IntoResponse`](axum::response::IntoResponse) implementation.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use driftline_core::model::ModelError;
use driftline_core::{EngineError, ExportError};

/// Errors that can occur in the HTTP layer.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The request carried no session header.
    #[error("missing `x-session-id` header")]
    MissingSession,

    /// The session header or parameter is not a valid session id.
    #[error("invalid session id: {0}")]
    InvalidSession(String),

    /// The request body could not be parsed.
    #[error("invalid request body: {0}")]
    InvalidBody(String),

    /// The requested resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// An engine operation failed.
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl ApiError {
    /// The HTTP status this error is reported with.
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::MissingSession | Self::InvalidSession(_) | Self::InvalidBody(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Engine(err) => match err {
                EngineError::NoChannel { .. } => StatusCode::BAD_REQUEST,
                EngineError::NoModel { .. } => StatusCode::PRECONDITION_FAILED,
                EngineError::Rewind(_) => StatusCode::UNPROCESSABLE_ENTITY,
                EngineError::NotFound { .. } => StatusCode::NOT_FOUND,
                EngineError::Export { source } => match source {
                    ExportError::NoOutputters
                    | ExportError::InvalidFilename { .. }
                    | ExportError::Model(ModelError::UnsupportedOutputter { .. }) => {
                        StatusCode::BAD_REQUEST
                    }
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                },
                EngineError::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, %status, "request rejected");
        }

        let body = serde_json::json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        });

        (status, axum::Json(body)).into_response()
    }
}
