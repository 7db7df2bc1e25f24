//! The step task: one asynchronous run of a session's model.
//!
//! A [`StepTask`] walks through
//! `AwaitingStart -> Stepping -> AwaitingNextStep -> ... -> {Completed | Killed | Failed}`:
//!
//! - **AwaitingStart** emits `prepared` and waits on the session [`Gate`]
//!   for the client's acknowledgement, up to the start timeout.
//! - **Stepping** advances the model (and uncertainty workers, if any),
//!   aggregates their output, and emits one `step` event.
//! - **AwaitingNextStep** clears the gate unless the session is in
//!   free-run mode, waits for the next acknowledgement up to the idle
//!   ceiling, then yields briefly before looping.
//!
//! Cancellation is cooperative: the task checks its [`CancellationToken`]
//! at every suspension point. A timeout emits `timeout` and cancels the
//! task's own token, so timeouts and kills leave through the same `killed`
//! path. Whatever the outcome, the registered [`RunFinalizer`]s run exactly
//! once after the loop ends.
//!
//! [`Gate`]: crate::gate::Gate

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use driftline_types::{ChannelEvent, OutputRecord, RunId, StepPayload};
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::ensemble::{self, AggregateError};
use crate::export::ExportError;
use crate::model::{ModelError, SharedModel, SimulationModel, StepOutcome, UncertaintySource};
use crate::registry::ChannelRegistry;
use crate::session::{NUM_SENT_KEY, Session, diff_aux};

/// Message sent with `timeout` when the client never acknowledges `prepared`.
fn start_timeout_message(limit: Duration) -> String {
    format!("Model not started, timed out after {} sec", limit.as_secs_f64())
}

/// Message sent with `timeout` when the client stops acknowledging steps.
fn step_timeout_message(limit: Duration) -> String {
    format!("Model run timed out after {} sec", limit.as_secs_f64())
}

/// Message sent with `killed`.
pub const KILLED_MESSAGE: &str = "Model run terminated early";

/// Message sent with `complete`.
pub const COMPLETE_MESSAGE: &str = "Model run completed";

/// Errors that end a run in the `Failed` state.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// The model, one of its outputters, or the uncertainty setup failed.
    #[error(transparent)]
    Model(#[from] ModelError),

    /// Uncertainty output could not be merged, or a worker failed.
    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    /// The run panicked.
    #[error("step task panicked: {0}")]
    Panicked(String),

    /// The blocking model step was cancelled before it finished.
    #[error("model step aborted: {0}")]
    Aborted(String),
}

/// What a run sends with each `step` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Send every step's full output record.
    Stream,
    /// Send only the running step counter; output goes to attached writers.
    Export,
}

impl RunMode {
    /// Whether full output records are sent to the client.
    pub const fn sends_output(self) -> bool {
        matches!(self, Self::Stream)
    }
}

/// Terminal state of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The model ran out of steps.
    Completed,
    /// The run was cancelled by a kill request or a timeout.
    Killed,
    /// The run failed; `message` is what the client was told.
    Failed {
        /// The reported error.
        message: String,
    },
}

impl RunOutcome {
    /// Whether the run finished cleanly.
    pub const fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Summary returned by a finished run.
#[derive(Debug)]
pub struct RunReport {
    /// The run's id.
    pub run: RunId,
    /// How the run ended.
    pub outcome: RunOutcome,
    /// Number of `step` events emitted.
    pub steps_sent: u64,
    /// Errors raised by finalizers, in registration order.
    pub finalizer_errors: Vec<ExportError>,
}

/// Everything a run (and its finalizers) operates on.
#[derive(Clone)]
pub struct RunContext {
    /// The run's id.
    pub run: RunId,
    /// The session the run belongs to.
    pub session: Arc<Session>,
    /// Where events are delivered.
    pub registry: Arc<ChannelRegistry>,
    /// The model being stepped.
    pub model: SharedModel,
}

impl core::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RunContext")
            .field("run", &self.run)
            .field("session", &self.session.id())
            .finish_non_exhaustive()
    }
}

impl RunContext {
    /// Deliver an event to the session's current channel.
    pub async fn emit(&self, event: ChannelEvent) -> bool {
        self.registry.emit(self.session.id(), event).await
    }
}

/// Cleanup registered when a run is created, run once after it ends.
pub trait RunFinalizer: Send + Sync {
    /// Finish up after the run reached `outcome`.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError`] if cleanup or artifact assembly fails.
    fn finalize(
        self: Box<Self>,
        ctx: RunContext,
        outcome: RunOutcome,
    ) -> BoxFuture<'static, Result<(), ExportError>>;
}

/// How the stepping loop ended without failing.
enum Exit {
    Exhausted,
    Cancelled,
}

/// Result of waiting on the gate.
enum Wake {
    Set,
    TimedOut,
    Cancelled,
}

/// A single run of one session's model.
pub struct StepTask {
    ctx: RunContext,
    mode: RunMode,
    policy: EngineConfig,
    uncertainty: Option<Arc<dyn UncertaintySource>>,
    token: CancellationToken,
    finalizers: Vec<Box<dyn RunFinalizer>>,
    steps_sent: u64,
}

impl StepTask {
    /// Create a run. Nothing happens until [`StepTask::run`] is awaited.
    pub fn new(
        ctx: RunContext,
        mode: RunMode,
        policy: EngineConfig,
        token: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            mode,
            policy,
            uncertainty: None,
            token,
            finalizers: Vec::new(),
            steps_sent: 0,
        }
    }

    /// Use `source` to establish uncertainty workers for capable models.
    #[must_use]
    pub fn with_uncertainty(mut self, source: Option<Arc<dyn UncertaintySource>>) -> Self {
        self.uncertainty = source;
        self
    }

    /// Register cleanup to run after the task ends.
    #[must_use]
    pub fn with_finalizers(mut self, finalizers: Vec<Box<dyn RunFinalizer>>) -> Self {
        self.finalizers.extend(finalizers);
        self
    }

    /// Drive the run to a terminal state, then run its finalizers.
    pub async fn run(mut self) -> RunReport {
        let session_id = self.ctx.session.id();
        let run = self.ctx.run;
        let entry = self.ctx.session.aux_snapshot();

        let result = AssertUnwindSafe(self.drive()).catch_unwind().await;
        let outcome = match result {
            Ok(Ok(Exit::Exhausted)) => {
                info!(session = %session_id, %run, steps = self.steps_sent, "model run completed");
                RunOutcome::Completed
            }
            Ok(Ok(Exit::Cancelled)) => {
                info!(session = %session_id, %run, steps = self.steps_sent, "run exiting early");
                self.ctx
                    .emit(ChannelEvent::Killed(String::from(KILLED_MESSAGE)))
                    .await;
                RunOutcome::Killed
            }
            Ok(Err(err)) => self.fail(&err).await,
            Err(payload) => {
                self.fail(&StepError::Panicked(panic_message(payload.as_ref())))
                    .await
            }
        };

        self.reconcile_aux(entry);

        if outcome.is_completed() {
            self.ctx
                .emit(ChannelEvent::Complete(String::from(COMPLETE_MESSAGE)))
                .await;
        }

        let mut finalizer_errors = Vec::new();
        for finalizer in std::mem::take(&mut self.finalizers) {
            if let Err(err) = finalizer.finalize(self.ctx.clone(), outcome.clone()).await {
                error!(session = %session_id, %run, error = %err, "run finalizer failed");
                finalizer_errors.push(err);
            }
        }

        RunReport {
            run,
            outcome,
            steps_sent: self.steps_sent,
            finalizer_errors,
        }
    }

    async fn drive(&mut self) -> Result<Exit, StepError> {
        self.ctx.emit(ChannelEvent::Prepared).await;

        let start_timeout = self.policy.start_timeout();
        match self.wait_gate(start_timeout).await {
            Wake::Set => info!(session = %self.ctx.session.id(), run = %self.ctx.run, "model run triggered"),
            Wake::TimedOut => self.time_out(start_timeout_message(start_timeout)).await,
            Wake::Cancelled => return Ok(Exit::Cancelled),
        }

        let step_timeout = self.policy.step_timeout();
        let token = self.token.clone();
        loop {
            if self.token.is_cancelled() {
                return Ok(Exit::Cancelled);
            }

            let Some(output) = self.advance().await? else {
                return Ok(Exit::Exhausted);
            };

            // A kill that landed while the model was locked wins over the step.
            if self.token.is_cancelled() {
                return Ok(Exit::Cancelled);
            }
            // Close the gate before the client can see the step and answer it.
            if !self.ctx.session.is_free_run() {
                self.ctx.session.gate().clear();
            }
            // A lagging client holds the run here until it catches up.
            tokio::select! {
                biased;
                () = token.cancelled() => return Ok(Exit::Cancelled),
                () = self.send(output) => {}
            }

            match self.wait_gate(step_timeout).await {
                Wake::Set => {}
                Wake::TimedOut => self.time_out(step_timeout_message(step_timeout)).await,
                Wake::Cancelled => return Ok(Exit::Cancelled),
            }

            tokio::select! {
                biased;
                () = self.token.cancelled() => return Ok(Exit::Cancelled),
                () = tokio::time::sleep(self.policy.yield_interval()) => {}
            }
        }
    }

    /// Run one model step and merge uncertainty output into it.
    ///
    /// The model and its workers are stepped on the blocking pool, so a
    /// slow step never stalls other sessions. Returns `None` when the model
    /// is exhausted.
    async fn advance(&self) -> Result<Option<OutputRecord>, StepError> {
        let session = Arc::clone(&self.ctx.session);
        let source = self.uncertainty.clone();
        let block = self.policy.uncertainty_block.clone();
        let model = Arc::clone(&self.ctx.model).lock_owned().await;

        tokio::task::spawn_blocking(move || {
            step_blocking(&session, model, source.as_deref(), &block)
        })
        .await
        .map_err(blocking_failure)?
    }

    async fn send(&mut self, output: OutputRecord) {
        self.steps_sent = self.steps_sent.saturating_add(1);
        self.ctx.session.set_num_sent(self.steps_sent);

        let payload = if self.mode.sends_output() && !output.is_empty() {
            StepPayload::Output(output)
        } else {
            StepPayload::Counter(self.steps_sent)
        };
        debug!(session = %self.ctx.session.id(), num_sent = self.steps_sent, "step emitted");
        self.ctx.emit(ChannelEvent::Step(payload)).await;
    }

    async fn wait_gate(&self, limit: Duration) -> Wake {
        tokio::select! {
            biased;
            () = self.token.cancelled() => Wake::Cancelled,
            set = self.ctx.session.gate().wait(limit) => {
                if set { Wake::Set } else { Wake::TimedOut }
            }
        }
    }

    /// Tell the client the run timed out, then cancel it.
    async fn time_out(&self, message: String) {
        warn!(session = %self.ctx.session.id(), run = %self.ctx.run, %message, "run timed out");
        self.ctx.emit(ChannelEvent::Timeout(message)).await;
        self.token.cancel();
    }

    async fn fail(&self, err: &StepError) -> RunOutcome {
        let message = if self.policy.develop_mode {
            error_chain(err)
        } else {
            err.to_string()
        };
        error!(
            severity = "critical",
            session = %self.ctx.session.id(),
            run = %self.ctx.run,
            error = %error_chain(err),
            "step task terminated due to error"
        );
        self.ctx
            .emit(ChannelEvent::RuntimeError(message.clone()))
            .await;
        RunOutcome::Failed { message }
    }

    /// Log auxiliary keys someone else changed during the run.
    ///
    /// The step counter is written live, so nothing is left to persist;
    /// an external change (e.g. a rewind resetting the counter) stands.
    fn reconcile_aux(&self, mut expected: crate::session::AuxState) {
        expected.insert(
            NUM_SENT_KEY.to_owned(),
            serde_json::Value::from(self.steps_sent),
        );
        let actual = self.ctx.session.aux_snapshot();
        for change in diff_aux(&expected, &actual) {
            info!(
                session = %self.ctx.session.id(),
                key = %change.key,
                expected = ?change.expected,
                actual = ?change.actual,
                "session property changed during run"
            );
        }
    }
}

impl core::fmt::Debug for StepTask {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StepTask")
            .field("run", &self.ctx.run)
            .field("session", &self.ctx.session.id())
            .field("mode", &self.mode)
            .field("finalizers", &self.finalizers.len())
            .finish_non_exhaustive()
    }
}

/// One model step, run off the async executor.
fn step_blocking(
    session: &Session,
    mut model: OwnedMutexGuard<Box<dyn SimulationModel>>,
    source: Option<&dyn UncertaintySource>,
    block: &str,
) -> Result<Option<OutputRecord>, StepError> {
    if model.current_time_step() == -1 {
        prepare_uncertainty(session, &**model, source)?;
    }

    let began = Instant::now();
    let output = match model.step()? {
        StepOutcome::Output(output) => output,
        StepOutcome::Exhausted => {
            debug!(session = %session.id(), "model exhausted");
            session.drop_uncertainty_workers();
            return Ok(None);
        }
    };
    drop(model);

    let began_uncertain = Instant::now();
    let worker_results = session.with_uncertainty_workers(|workers| workers.step_all());
    let mut output = ensemble::aggregate(output, worker_results.as_deref(), block)?;
    if worker_results.is_some() {
        ensemble::attach_response_times(&mut output, began_uncertain.elapsed(), began.elapsed());
    }
    Ok(Some(output))
}

/// Reset uncertainty workers before the model's first step.
fn prepare_uncertainty(
    session: &Session,
    model: &dyn SimulationModel,
    source: Option<&dyn UncertaintySource>,
) -> Result<(), StepError> {
    session.drop_uncertainty_workers();

    if !model.has_weathering_uncertainty() {
        info!(session = %session.id(), "model does not have weathering uncertainty");
        return Ok(());
    }
    let Some(source) = source else {
        warn!(session = %session.id(), "model has weathering uncertainty but no uncertainty source is configured");
        return Ok(());
    };

    let workers = source.establish(model)?;
    info!(session = %session.id(), workers = workers.len(), "model has weathering uncertainty");
    session.set_uncertainty_workers(workers);
    Ok(())
}

fn blocking_failure(err: JoinError) -> StepError {
    match err.try_into_panic() {
        Ok(payload) => StepError::Panicked(panic_message(payload.as_ref())),
        Err(err) => StepError::Aborted(err.to_string()),
    }
}

/// Render an error and its sources as `outer: inner: ...`.
pub fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| String::from("unknown panic"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::path::PathBuf;

    use driftline_types::{ChannelId, SessionId};
    use serde_json::json;

    use super::*;
    use crate::config::StubModelConfig;
    use crate::model::share_model;
    use crate::registry::{self, ChannelReceiver};
    use crate::stub::StubModel;

    fn fast_policy() -> EngineConfig {
        EngineConfig {
            start_timeout_ms: 2_000,
            step_timeout_ms: 2_000,
            yield_interval_ms: 0,
            ..EngineConfig::default()
        }
    }

    fn context(steps: u32) -> (RunContext, ChannelReceiver) {
        let registry = Arc::new(ChannelRegistry::new());
        let session = Arc::new(Session::new(SessionId::new(), PathBuf::from("/tmp/unused")));
        let (tx, rx) = registry::channel();
        registry.bind(session.id(), ChannelId::new(), tx);
        let model = share_model(StubModel::new(&StubModelConfig {
            steps,
            ..StubModelConfig::default()
        }));
        (
            RunContext {
                run: RunId::new(),
                session,
                registry,
                model,
            },
            rx,
        )
    }

    #[test]
    fn context_debug_names_run_and_session() {
        let (ctx, _rx) = context(1);
        let rendered = format!("{ctx:?}");
        assert!(rendered.starts_with("RunContext"));
        assert!(rendered.contains(&ctx.run.to_string()));
        assert!(rendered.contains(&ctx.session.id().to_string()));
    }

    fn drain(rx: &mut ChannelReceiver) -> Vec<ChannelEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn timeout_messages_use_seconds() {
        assert_eq!(
            start_timeout_message(Duration::from_secs(16)),
            "Model not started, timed out after 16 sec"
        );
        assert_eq!(
            step_timeout_message(Duration::from_secs(6000)),
            "Model run timed out after 6000 sec"
        );
    }

    #[test]
    fn error_chain_includes_sources() {
        let err = StepError::from(ModelError::OutputterIo {
            path: PathBuf::from("out.jsonl"),
            source: std::io::Error::other("disk full"),
        });
        let chain = error_chain(&err);
        assert!(chain.starts_with("outputter I/O error on out.jsonl"));
        assert!(chain.ends_with(": disk full"));
    }

    #[tokio::test]
    async fn free_run_streams_every_step_then_completes() {
        let (ctx, mut rx) = context(3);
        ctx.session.set_free_run(true);
        ctx.session.gate().set();
        let task = StepTask::new(ctx.clone(), RunMode::Stream, fast_policy(), CancellationToken::new());

        let report = task.run().await;
        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.steps_sent, 3);
        assert_eq!(ctx.session.num_sent(), 3);

        let events = drain(&mut rx);
        let names: Vec<&str> = events.iter().map(ChannelEvent::name).collect();
        assert_eq!(names, ["prepared", "step", "step", "step", "complete"]);
        let Some(ChannelEvent::Step(StepPayload::Output(first))) = events.get(1) else {
            panic!("second event should be a full step");
        };
        assert_eq!(first["step_num"], json!(0));
        assert_eq!(first["WeatheringOutput"]["low"], serde_json::Value::Null);
    }

    #[tokio::test]
    async fn export_mode_sends_counters() {
        let (ctx, mut rx) = context(2);
        ctx.session.set_free_run(true);
        ctx.session.gate().set();
        let report = StepTask::new(ctx, RunMode::Export, fast_policy(), CancellationToken::new())
            .run()
            .await;
        assert!(report.outcome.is_completed());

        let counters: Vec<ChannelEvent> = drain(&mut rx)
            .into_iter()
            .filter(|e| e.name() == "step")
            .collect();
        assert_eq!(
            counters,
            [
                ChannelEvent::Step(StepPayload::Counter(1)),
                ChannelEvent::Step(StepPayload::Counter(2)),
            ]
        );
    }

    #[tokio::test]
    async fn pre_cancelled_run_is_killed_without_steps() {
        let (ctx, mut rx) = context(3);
        let token = CancellationToken::new();
        token.cancel();
        let report = StepTask::new(ctx, RunMode::Stream, fast_policy(), token)
            .run()
            .await;
        assert_eq!(report.outcome, RunOutcome::Killed);
        assert_eq!(
            drain(&mut rx),
            [
                ChannelEvent::Prepared,
                ChannelEvent::Killed(String::from(KILLED_MESSAGE)),
            ]
        );
    }
}
