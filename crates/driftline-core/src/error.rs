//! Error type for engine operations.
//!
//! [`EngineError`] is what the request-facing operations on
//! [`Engine`](crate::engine::Engine) return. Failures inside a running step
//! task never surface here; they are reported over the session's channel.

use std::path::PathBuf;

use driftline_types::SessionId;

use crate::export::ExportError;
use crate::model::ModelError;

/// Errors returned by [`Engine`](crate::engine::Engine) operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The session has no event channel bound.
    #[error("no event channel bound for session {session}")]
    NoChannel {
        /// The session that asked.
        session: SessionId,
    },

    /// The session has no model and none could be provided.
    #[error("no active model for session {session}")]
    NoModel {
        /// The session that asked.
        session: SessionId,
    },

    /// The model refused to rewind.
    #[error("could not rewind model: {0}")]
    Rewind(#[source] ModelError),

    /// An export could not be prepared.
    #[error("export error: {source}")]
    Export {
        /// The underlying export error.
        #[from]
        source: ExportError,
    },

    /// A requested file does not exist in the session directory.
    #[error("file not found: {name}")]
    NotFound {
        /// The requested file name.
        name: String,
    },

    /// Filesystem access failed.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        /// The path being accessed.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },
}
