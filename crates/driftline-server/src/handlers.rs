//! HTTP endpoint handlers.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/health` | Liveness and run counts |
//! | `GET` | `/async_step` | Start a streaming run |
//! | `PUT` | `/ws_export` | Start an export run |
//! | `GET` | `/ws_export?filename=` | Download an exported artifact |
//! | `GET` | `/rewind` | Rewind the session's model |
//!
//! Every endpoint except `/health` requires the `x-session-id` header.

use std::sync::Arc;

use axum::Json;
use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::header;
use axum::response::IntoResponse;
use driftline_core::{ExportRequest, RunStart};
use driftline_types::RunId;
use tokio_util::io::ReaderStream;
use tracing::info;

use crate::error::ApiError;
use crate::session::Session;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// Query parameters for `GET /ws_export`.
#[derive(Debug, serde::Deserialize)]
pub struct DownloadQuery {
    /// Name of the artifact in the session directory.
    pub filename: Option<String>,
}

/// Response to a run request.
#[derive(Debug, serde::Serialize)]
struct RunResponse {
    /// `started` or `already_running`.
    status: &'static str,
    /// The new run's id, when one was started.
    #[serde(skip_serializing_if = "Option::is_none")]
    run_id: Option<RunId>,
}

impl From<RunStart> for RunResponse {
    fn from(start: RunStart) -> Self {
        match start {
            RunStart::Started(run) => Self {
                status: "started",
                run_id: Some(run),
            },
            RunStart::AlreadyRunning => Self {
                status: "already_running",
                run_id: None,
            },
        }
    }
}

/// Generic success response.
#[derive(Debug, serde::Serialize)]
struct StatusResponse {
    /// Whether the operation succeeded.
    ok: bool,
    /// Human-readable message.
    message: String,
}

// ---------------------------------------------------------------------------
// GET /health
// ---------------------------------------------------------------------------

/// Report liveness with session and run counts.
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "sessions": state.engine.sessions().len(),
        "active_runs": state.engine.registry().active_count(),
    }))
}

// ---------------------------------------------------------------------------
// GET /async_step
// ---------------------------------------------------------------------------

/// Start a run that streams every step's output over the event channel.
///
/// A request while a run is active is a no-op reported as
/// `already_running`.
pub async fn async_step(
    State(state): State<Arc<AppState>>,
    Session(session): Session,
) -> Result<impl IntoResponse, ApiError> {
    info!(%session, "async step requested");
    let start = state.engine.run_model(session)?;
    Ok(Json(RunResponse::from(start)))
}

// ---------------------------------------------------------------------------
// PUT /ws_export
// ---------------------------------------------------------------------------

/// Start a run writing through temporary outputters.
///
/// Only the step counter is sent per step; the artifact name arrives with
/// `export_finished`.
pub async fn start_export(
    State(state): State<Arc<AppState>>,
    Session(session): Session,
    body: Result<Json<ExportRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(request) = body.map_err(|e| ApiError::InvalidBody(e.body_text()))?;
    let start = state.engine.run_export(session, &request).await?;
    Ok(Json(RunResponse::from(start)))
}

// ---------------------------------------------------------------------------
// GET /ws_export?filename=
// ---------------------------------------------------------------------------

/// Download an exported artifact as an attachment.
pub async fn download_export(
    State(state): State<Arc<AppState>>,
    Session(session): Session,
    Query(query): Query<DownloadQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let filename = query
        .filename
        .filter(|f| !f.is_empty())
        .ok_or_else(|| ApiError::NotFound(String::from("File(s) requested do not exist on the server!")))?;

    let path = state.engine.export_path(session, &filename).await?;
    let io_error = |source| driftline_core::EngineError::Io {
        path: path.clone(),
        source,
    };
    let file = tokio::fs::File::open(&path).await.map_err(io_error)?;
    let size = file.metadata().await.map_err(io_error)?.len();
    info!(%session, %filename, size, "export download started");

    Ok((
        [
            (header::CONTENT_TYPE, String::from("application/octet-stream")),
            (header::CONTENT_LENGTH, size.to_string()),
            (header::CONTENT_DISPOSITION, content_disposition(&filename)),
        ],
        Body::from_stream(ReaderStream::new(file)),
    ))
}

/// `Content-Disposition` value for an attachment named `filename`.
fn content_disposition(filename: &str) -> String {
    let mut quoted = String::with_capacity(filename.len());
    for c in filename.chars() {
        if matches!(c, '"' | '\\') {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    format!("attachment; filename=\"{quoted}\"")
}

// ---------------------------------------------------------------------------
// GET /rewind
// ---------------------------------------------------------------------------

/// Rewind the session's model, cancelling any active run.
pub async fn rewind(
    State(state): State<Arc<AppState>>,
    Session(session): Session,
) -> Result<impl IntoResponse, ApiError> {
    state.engine.rewind(session).await?;
    Ok(Json(StatusResponse {
        ok: true,
        message: String::from("Model rewound"),
    }))
}
