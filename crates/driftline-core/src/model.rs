//! The simulation model contract consumed by the engine.
//!
//! The model itself (its physics, how it is built from uploaded
//! configuration, what its outputters write) lives outside this crate. The
//! engine only needs a narrow surface: advance one step, rewind, report
//! whether uncertainty runs are possible, and attach/detach output writers.
//!
//! Uncertainty workers are a separate collaborator: a set of perturbed model
//! copies advanced in parallel with the nominal model, each reporting either
//! an output fragment or an encoded failure.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use driftline_types::{OutputRecord, OutputterId, SessionId};
use serde::{Deserialize, Serialize};

/// Errors raised by a model, its outputters, or its uncertainty workers.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    /// A step could not be computed.
    #[error("step {step} failed: {message}")]
    Step {
        /// The time step that failed.
        step: i64,
        /// Description of the failure.
        message: String,
    },

    /// The model could not be rewound.
    #[error("rewind failed: {message}")]
    Rewind {
        /// Description of the failure.
        message: String,
    },

    /// An outputter failed to write its file.
    #[error("outputter I/O error on {}: {source}", path.display())]
    OutputterIo {
        /// The file the outputter was writing.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// No outputter exists for the requested type.
    #[error("unsupported outputter type: {obj_type}")]
    UnsupportedOutputter {
        /// The requested outputter type.
        obj_type: String,
    },

    /// Uncertainty workers could not be established.
    #[error("uncertainty setup failed: {message}")]
    Uncertainty {
        /// Description of the failure.
        message: String,
    },

    /// Output could not be serialized.
    #[error("output serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result of asking the model for one more step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The step ran and produced this output.
    Output(OutputRecord),
    /// The model has no more steps. This is normal termination.
    Exhausted,
}

/// A stepped simulation model.
pub trait SimulationModel: Send {
    /// Index of the last completed step, `-1` before the first step.
    fn current_time_step(&self) -> i64;

    /// Advance the model by one step.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError`] if the step cannot be computed or an attached
    /// outputter fails.
    fn step(&mut self) -> Result<StepOutcome, ModelError>;

    /// Reset the model to before its first step.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::Rewind`] if the model cannot be reset.
    fn rewind(&mut self) -> Result<(), ModelError>;

    /// Whether this model supports weathering uncertainty runs.
    fn has_weathering_uncertainty(&self) -> bool;

    /// Attach an output writer.
    fn add_outputter(&mut self, outputter: Box<dyn Outputter>);

    /// Detach the output writer with this identity, returning it.
    fn remove_outputter(&mut self, id: OutputterId) -> Option<Box<dyn Outputter>>;
}

/// A model shared between its session's step task and administrative
/// operations. Whoever holds the lock may mutate it.
pub type SharedModel = Arc<tokio::sync::Mutex<Box<dyn SimulationModel>>>;

/// Wrap a model for sharing.
pub fn share_model(model: impl SimulationModel + 'static) -> SharedModel {
    let boxed: Box<dyn SimulationModel> = Box::new(model);
    Arc::new(tokio::sync::Mutex::new(boxed))
}

/// An output writer attached to a model.
pub trait Outputter: Send {
    /// This writer's identity on the model.
    fn id(&self) -> OutputterId;

    /// Path of the file this writer produces.
    ///
    /// Some writers append `.zip` to this path when they finish.
    fn filename(&self) -> &Path;

    /// Record one step's output.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError`] if the output cannot be written.
    fn write_step(&mut self, step: i64, record: &OutputRecord) -> Result<(), ModelError>;

    /// Forget everything written so far.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError`] if the writer cannot reset its output.
    fn rewind(&mut self) -> Result<(), ModelError> {
        Ok(())
    }
}

fn default_obj_type() -> String {
    String::from("json_lines")
}

/// Client request for one temporary outputter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputterSpec {
    /// Which kind of writer to build.
    #[serde(default = "default_obj_type")]
    pub obj_type: String,

    /// Target file. Rewritten into the run's scratch directory before use.
    pub filename: PathBuf,

    /// Writer-specific parameters.
    #[serde(flatten)]
    pub params: BTreeMap<String, serde_json::Value>,
}

/// Builds outputters against a model's object graph.
pub trait OutputterFactory: Send + Sync {
    /// Build the writer described by `spec`.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError`] if the writer cannot be built.
    fn create(
        &self,
        spec: &OutputterSpec,
        model: &dyn SimulationModel,
    ) -> Result<Box<dyn Outputter>, ModelError>;
}

/// An uncertainty worker's failure, carried back to the nominal task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerFailure {
    /// The worker's error message.
    pub message: String,
    /// Where the error arose (worker, step, cause chain).
    pub context: String,
}

/// What one uncertainty worker produced for a step.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerResult {
    /// The worker's output record for the step.
    Fragment(OutputRecord),
    /// The worker failed; the failure must be re-raised by the caller.
    Failed(WorkerFailure),
}

/// A set of uncertainty workers advanced together.
pub trait UncertaintyWorkers: Send {
    /// Advance every worker by one step, in parallel.
    ///
    /// Returns one result per worker, in worker order.
    fn step_all(&mut self) -> Vec<WorkerResult>;

    /// Number of workers in the set.
    fn len(&self) -> usize;

    /// Whether the set has no workers.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Establishes uncertainty workers for a model.
pub trait UncertaintySource: Send + Sync {
    /// Build a fresh worker set positioned before the model's first step.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::Uncertainty`] if the workers cannot be built.
    fn establish(
        &self,
        model: &dyn SimulationModel,
    ) -> Result<Box<dyn UncertaintyWorkers>, ModelError>;
}

/// Supplies the active model for a session that has none installed.
pub trait ModelProvider: Send + Sync {
    /// The model to install for `session`, if one can be provided.
    fn provide(&self, session: SessionId) -> Option<SharedModel>;
}
