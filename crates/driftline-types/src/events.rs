//! Messages exchanged over a session's event channel.
//!
//! Outbound frames are [`ChannelEvent`]s, inbound frames are
//! [`ClientMessage`]s. Both serialize as `{"event": <name>, "data": <payload>}`.
//! The event names are a wire contract with existing clients and must not
//! change.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// One step's output: named result blocks keyed by block name.
///
/// Produced fresh by the model on every step and never mutated after it
/// has been emitted.
pub type OutputRecord = BTreeMap<String, serde_json::Value>;

/// Payload of a `step` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(untagged)]
#[ts(export, export_to = "bindings/")]
pub enum StepPayload {
    /// The full (possibly ensemble-aggregated) output record of the step.
    Output(OutputRecord),
    /// Heartbeat only: the running count of steps sent in this run.
    Counter(u64),
}

/// Event emitted by the engine to a session's channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(tag = "event", content = "data")]
#[ts(export, export_to = "bindings/")]
pub enum ChannelEvent {
    /// The run is ready; the client must acknowledge to start stepping.
    #[serde(rename = "prepared")]
    Prepared,
    /// The client did not acknowledge in time; the run is being cancelled.
    #[serde(rename = "timeout")]
    Timeout(String),
    /// The run was cancelled before it finished.
    #[serde(rename = "killed")]
    Killed(String),
    /// One completed step.
    #[serde(rename = "step")]
    Step(StepPayload),
    /// The model ran out of steps.
    #[serde(rename = "complete")]
    Complete(String),
    /// Stepping failed; the payload is the failure message.
    #[serde(rename = "runtimeError")]
    RuntimeError(String),
    /// The export artifact is ready for download under this file name.
    #[serde(rename = "export_finished")]
    ExportFinished(String),
    /// The export run did not finish cleanly; no artifact was produced.
    #[serde(rename = "export_failed")]
    ExportFailed,
}

impl ChannelEvent {
    /// The wire name of this event.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Prepared => "prepared",
            Self::Timeout(_) => "timeout",
            Self::Killed(_) => "killed",
            Self::Step(_) => "step",
            Self::Complete(_) => "complete",
            Self::RuntimeError(_) => "runtimeError",
            Self::ExportFinished(_) => "export_finished",
            Self::ExportFailed => "export_failed",
        }
    }
}

/// Message sent by the client over its event channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(tag = "event", content = "data")]
#[ts(export, export_to = "bindings/")]
pub enum ClientMessage {
    /// Open the session's gate: start the run or permit the next step.
    #[serde(rename = "ack")]
    Ack,
    /// Cancel the session's active run.
    #[serde(rename = "kill")]
    Kill,
    /// Switch free-run mode on or off.
    #[serde(rename = "isAsync")]
    IsAsync(bool),
}
