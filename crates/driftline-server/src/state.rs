//! Shared application state for the Driftline server.
//!
//! [`AppState`] wraps the [`Engine`]. It is held in an [`Arc`] and injected
//! into handlers via Axum's `State` extractor.
//!
//! [`Arc`]: std::sync::Arc

use driftline_core::Engine;

/// Shared state for the Axum application.
#[derive(Debug)]
pub struct AppState {
    /// The stepping engine every route drives.
    pub engine: Engine,
}

impl AppState {
    /// Create application state around `engine`.
    pub const fn new(engine: Engine) -> Self {
        Self { engine }
    }
}
