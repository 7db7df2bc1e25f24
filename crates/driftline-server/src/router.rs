//! Axum router construction for the Driftline server.
//!
//! Assembles the run-control routes and the event socket into a single
//! [`Router`] with CORS enabled for browser clients.

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;
use crate::ws;

/// Build the complete Axum router.
///
/// The router includes:
/// - `GET /health` -- liveness and run counts
/// - `GET /async_step` -- start a streaming run
/// - `PUT /ws_export` -- start an export run
/// - `GET /ws_export` -- download an exported artifact
/// - `GET /rewind` -- rewind the session's model
/// - `GET /socket` -- the session's `WebSocket` event channel
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health))
        .route("/async_step", get(handlers::async_step))
        .route(
            "/ws_export",
            get(handlers::download_export).put(handlers::start_export),
        )
        .route("/rewind", get(handlers::rewind))
        .route("/socket", get(ws::socket))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
