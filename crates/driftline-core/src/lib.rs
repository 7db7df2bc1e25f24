//! Asynchronous stepping engine for Driftline.
//!
//! A client asks for a run; the engine steps the session's model one step at
//! a time, pushing each step's output over the client's event channel and
//! waiting for an acknowledgement before the next step.
//!
//! # Modules
//!
//! - [`config`] -- Configuration loading from `driftline-config.yaml` into
//!   strongly-typed structs.
//! - [`engine`] -- [`Engine`], the facade the server calls.
//! - [`ensemble`] -- Merging uncertainty-worker output into the nominal
//!   record.
//! - [`error`] -- [`EngineError`].
//! - [`export`] -- Temporary outputters and export artifact assembly.
//! - [`gate`] -- The per-session acknowledgement signal.
//! - [`model`] -- The model, outputter and uncertainty-worker contracts.
//! - [`registry`] -- Session-to-channel bindings and the active-run table.
//! - [`session`] -- Per-session state and the session store.
//! - [`step`] -- The step task state machine.
//! - [`stub`] -- A deterministic stub model and its collaborators.
//!
//! [`Engine`]: engine::Engine
//! [`EngineError`]: error::EngineError

pub mod config;
pub mod engine;
pub mod ensemble;
pub mod error;
pub mod export;
pub mod gate;
pub mod model;
pub mod registry;
pub mod session;
pub mod step;
pub mod stub;

pub use engine::{Engine, RunStart};
pub use error::EngineError;
pub use export::{ExportError, ExportRequest};
pub use step::{RunMode, RunOutcome, RunReport};
