//! Shared wire types for the Driftline stepping engine.
//!
//! Everything that crosses the process boundary lives here so the engine
//! and the HTTP/socket layer agree on one definition. Types flow to
//! `TypeScript` via `ts-rs` for the browser client.
//!
//! # Modules
//!
//! - [`ids`] -- Type-safe UUID wrappers for sessions, channels, runs and outputters
//! - [`events`] -- Channel events, step payloads and client messages

pub mod events;
pub mod ids;

// Re-export all public types at crate root for convenience.
pub use events::{ChannelEvent, ClientMessage, OutputRecord, StepPayload};
pub use ids::{ChannelId, OutputterId, RunId, SessionId};
