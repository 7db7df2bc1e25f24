//! Stub collaborators for running the engine without a real model.
//!
//! [`StubModel`] is a deterministic decaying-slick model that emits a
//! `WeatheringOutput` block per step. It exercises the whole engine
//! end-to-end (stepping, ensemble aggregation, export) before a real model
//! backend is wired in, and it is what the server hands to new sessions.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use driftline_types::{OutputRecord, OutputterId, SessionId};
use serde_json::json;
use tracing::debug;

use crate::config::StubModelConfig;
use crate::model::{
    ModelError, ModelProvider, Outputter, OutputterFactory, OutputterSpec, SharedModel,
    SimulationModel, StepOutcome, UncertaintySource, UncertaintyWorkers, WorkerFailure,
    WorkerResult, share_model,
};

// ---------------------------------------------------------------------------
// StubModel
// ---------------------------------------------------------------------------

/// A finite model whose floating mass decays geometrically each step.
pub struct StubModel {
    steps: u32,
    initial_mass: f64,
    decay_rate: f64,
    time_step_secs: u32,
    uncertainty: bool,
    start: DateTime<Utc>,
    current_time_step: i64,
    outputters: Vec<Box<dyn Outputter>>,
}

impl StubModel {
    /// Create a model from configuration, positioned before its first step.
    pub fn new(config: &StubModelConfig) -> Self {
        Self {
            steps: config.steps,
            initial_mass: config.initial_mass,
            decay_rate: config.decay_rate,
            time_step_secs: config.time_step_secs,
            uncertainty: config.uncertainty_workers > 0,
            start: Utc::now(),
            current_time_step: -1,
            outputters: Vec::new(),
        }
    }

    /// Same model with a different decay rate (used for uncertainty workers).
    #[must_use]
    pub fn with_decay_rate(mut self, decay_rate: f64) -> Self {
        self.decay_rate = decay_rate;
        self
    }

    /// Number of attached outputters.
    pub fn outputter_count(&self) -> usize {
        self.outputters.len()
    }

    fn weathering_block(&self, step: i64) -> serde_json::Value {
        let exponent = i32::try_from(step).unwrap_or(i32::MAX);
        let floating = self.initial_mass * (1.0 - self.decay_rate).powi(exponent);
        let elapsed = i64::from(self.time_step_secs).saturating_mul(step);
        let time_stamp = self
            .start
            .checked_add_signed(chrono::Duration::seconds(elapsed))
            .unwrap_or(self.start);
        json!({
            "time_stamp": time_stamp.to_rfc3339(),
            "floating": floating,
            "evaporated": self.initial_mass - floating,
        })
    }
}

impl SimulationModel for StubModel {
    fn current_time_step(&self) -> i64 {
        self.current_time_step
    }

    fn step(&mut self) -> Result<StepOutcome, ModelError> {
        let next = self.current_time_step.saturating_add(1);
        if next >= i64::from(self.steps) {
            return Ok(StepOutcome::Exhausted);
        }
        self.current_time_step = next;

        let mut record = OutputRecord::new();
        record.insert(String::from("step_num"), json!(next));
        record.insert(String::from("WeatheringOutput"), self.weathering_block(next));

        for outputter in &mut self.outputters {
            outputter.write_step(next, &record)?;
        }
        Ok(StepOutcome::Output(record))
    }

    fn rewind(&mut self) -> Result<(), ModelError> {
        self.current_time_step = -1;
        for outputter in &mut self.outputters {
            outputter.rewind()?;
        }
        Ok(())
    }

    fn has_weathering_uncertainty(&self) -> bool {
        self.uncertainty
    }

    fn add_outputter(&mut self, outputter: Box<dyn Outputter>) {
        self.outputters.push(outputter);
    }

    fn remove_outputter(&mut self, id: OutputterId) -> Option<Box<dyn Outputter>> {
        let index = self.outputters.iter().position(|o| o.id() == id)?;
        Some(self.outputters.remove(index))
    }
}

/// Hands every session a fresh [`StubModel`].
#[derive(Debug, Clone)]
pub struct StubModelProvider {
    config: StubModelConfig,
}

impl StubModelProvider {
    /// Create a provider building models from `config`.
    pub const fn new(config: StubModelConfig) -> Self {
        Self { config }
    }
}

impl ModelProvider for StubModelProvider {
    fn provide(&self, session: SessionId) -> Option<SharedModel> {
        debug!(%session, steps = self.config.steps, "providing stub model");
        Some(share_model(StubModel::new(&self.config)))
    }
}

// ---------------------------------------------------------------------------
// JSON lines outputter
// ---------------------------------------------------------------------------

/// Writes each step's output record as one JSON line.
///
/// The file is created (truncated) on the first write after construction or
/// rewind, and flushed after every line.
pub struct JsonLinesOutputter {
    id: OutputterId,
    filename: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl JsonLinesOutputter {
    /// Create a writer targeting `filename`.
    pub fn new(filename: impl Into<PathBuf>) -> Self {
        Self {
            id: OutputterId::new(),
            filename: filename.into(),
            writer: None,
        }
    }

    fn io_error(&self, source: std::io::Error) -> ModelError {
        ModelError::OutputterIo {
            path: self.filename.clone(),
            source,
        }
    }
}

impl Outputter for JsonLinesOutputter {
    fn id(&self) -> OutputterId {
        self.id
    }

    fn filename(&self) -> &Path {
        &self.filename
    }

    fn write_step(&mut self, step: i64, record: &OutputRecord) -> Result<(), ModelError> {
        if self.writer.is_none() {
            let file = File::create(&self.filename).map_err(|e| self.io_error(e))?;
            self.writer = Some(BufWriter::new(file));
        }
        let line = serde_json::to_string(&json!({ "step": step, "output": record }))?;
        let result = match self.writer.as_mut() {
            Some(writer) => writeln!(writer, "{line}").and_then(|()| writer.flush()),
            None => Ok(()),
        };
        result.map_err(|e| self.io_error(e))
    }

    fn rewind(&mut self) -> Result<(), ModelError> {
        self.writer = None;
        Ok(())
    }
}

/// Builds the writers the stub deployment knows about.
///
/// Supported `obj_type` values: `json_lines`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StubOutputterFactory;

impl OutputterFactory for StubOutputterFactory {
    fn create(
        &self,
        spec: &OutputterSpec,
        _model: &dyn SimulationModel,
    ) -> Result<Box<dyn Outputter>, ModelError> {
        match spec.obj_type.as_str() {
            "json_lines" => Ok(Box::new(JsonLinesOutputter::new(spec.filename.clone()))),
            other => Err(ModelError::UnsupportedOutputter {
                obj_type: other.to_owned(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Uncertainty workers
// ---------------------------------------------------------------------------

/// Uncertainty workers backed by in-process model copies.
///
/// Each call to [`step_all`](UncertaintyWorkers::step_all) advances every
/// copy on its own scoped OS thread and joins them all before returning.
pub struct LocalUncertaintyWorkers {
    models: Vec<Box<dyn SimulationModel>>,
}

impl LocalUncertaintyWorkers {
    /// Wrap a set of worker models.
    pub fn new(models: Vec<Box<dyn SimulationModel>>) -> Self {
        Self { models }
    }
}

impl UncertaintyWorkers for LocalUncertaintyWorkers {
    fn step_all(&mut self) -> Vec<WorkerResult> {
        std::thread::scope(|scope| {
            let handles: Vec<_> = self
                .models
                .iter_mut()
                .map(|model| scope.spawn(move || model.step()))
                .collect();

            handles
                .into_iter()
                .enumerate()
                .map(|(index, handle)| match handle.join() {
                    Ok(Ok(StepOutcome::Output(record))) => WorkerResult::Fragment(record),
                    Ok(Ok(StepOutcome::Exhausted)) => WorkerResult::Failed(WorkerFailure {
                        message: String::from("worker exhausted before the nominal model"),
                        context: format!("uncertainty worker {index}"),
                    }),
                    Ok(Err(e)) => WorkerResult::Failed(WorkerFailure {
                        message: e.to_string(),
                        context: format!("uncertainty worker {index}: {e:?}"),
                    }),
                    Err(_) => WorkerResult::Failed(WorkerFailure {
                        message: String::from("worker thread panicked"),
                        context: format!("uncertainty worker {index}"),
                    }),
                })
                .collect()
        })
    }

    fn len(&self) -> usize {
        self.models.len()
    }
}

/// Builds [`StubModel`] workers with decay rates spread around the nominal.
#[derive(Debug, Clone)]
pub struct StubUncertaintySource {
    config: StubModelConfig,
}

impl StubUncertaintySource {
    /// Create a source building workers from `config`.
    pub const fn new(config: StubModelConfig) -> Self {
        Self { config }
    }

    /// Decay rate of worker `index` out of `count`, evenly spread over
    /// `[rate * (1 - spread), rate * (1 + spread)]`.
    fn worker_decay_rate(&self, index: u32, count: u32) -> f64 {
        let rate = self.config.decay_rate;
        let spread = self.config.uncertainty_spread;
        if count <= 1 {
            return rate;
        }
        let position = f64::from(index) / f64::from(count.saturating_sub(1));
        rate * (1.0 - spread + 2.0 * spread * position)
    }
}

impl UncertaintySource for StubUncertaintySource {
    fn establish(
        &self,
        _model: &dyn SimulationModel,
    ) -> Result<Box<dyn UncertaintyWorkers>, ModelError> {
        let count = self.config.uncertainty_workers;
        if count == 0 {
            return Err(ModelError::Uncertainty {
                message: String::from("no uncertainty workers configured"),
            });
        }
        let models = (0..count)
            .map(|index| {
                let worker: Box<dyn SimulationModel> = Box::new(
                    StubModel::new(&self.config)
                        .with_decay_rate(self.worker_decay_rate(index, count)),
                );
                worker
            })
            .collect();
        Ok(Box::new(LocalUncertaintyWorkers::new(models)))
    }
}
