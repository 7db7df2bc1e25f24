//! HTTP and `WebSocket` surface for the Driftline stepping engine.
//!
//! This crate provides an Axum server that exposes:
//!
//! - **Run control** (`/async_step`, `/ws_export`, `/rewind`): start
//!   streaming or export runs and rewind a session's model
//! - **Event channel** (`/socket`): one `WebSocket` per session carrying
//!   [`ChannelEvent`]s out and [`ClientMessage`]s in
//! - **Artifact download** (`GET /ws_export?filename=`)
//!
//! Sessions are identified by the `x-session-id` header on HTTP requests
//! and by the `session` query parameter on the socket.
//!
//! [`ChannelEvent`]: driftline_types::ChannelEvent
//! [`ClientMessage`]: driftline_types::ClientMessage

pub mod error;
pub mod handlers;
pub mod router;
pub mod server;
pub mod session;
pub mod state;
pub mod ws;

// Re-export primary types for convenience.
pub use error::ApiError;
pub use router::build_router;
pub use server::{ServerError, start_server};
pub use session::SESSION_HEADER;
pub use state::AppState;
