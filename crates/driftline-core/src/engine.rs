//! The engine facade tying sessions, channels, runs and models together.
//!
//! [`Engine`] is what the HTTP and socket layers call. It owns the
//! [`SessionStore`], the [`ChannelRegistry`], and the collaborators that
//! supply models, outputters and uncertainty workers.

use std::path::PathBuf;
use std::sync::Arc;

use driftline_types::{ChannelId, RunId, SessionId};
use tracing::{debug, info};

use crate::config::{DriftlineConfig, EngineConfig};
use crate::error::EngineError;
use crate::export::{ExportCoordinator, ExportError, ExportRequest, plain_file_name};
use crate::model::{ModelProvider, OutputterFactory, SharedModel, UncertaintySource};
use crate::registry::{ChannelRegistry, ChannelSender, RunReservation};
use crate::session::{Session, SessionStore};
use crate::step::{RunContext, RunFinalizer, RunMode, StepTask};

/// Result of a request to start a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStart {
    /// A new run was launched.
    Started(RunId),
    /// A run is already active for the session; nothing was changed.
    AlreadyRunning,
}

/// The asynchronous stepping engine.
pub struct Engine {
    policy: EngineConfig,
    scratch_root: Option<PathBuf>,
    sessions: Arc<SessionStore>,
    registry: Arc<ChannelRegistry>,
    models: Arc<dyn ModelProvider>,
    outputters: Arc<dyn OutputterFactory>,
    uncertainty: Option<Arc<dyn UncertaintySource>>,
}

impl Engine {
    /// Create an engine from configuration and its model collaborators.
    pub fn new(
        config: &DriftlineConfig,
        models: Arc<dyn ModelProvider>,
        outputters: Arc<dyn OutputterFactory>,
    ) -> Self {
        Self {
            policy: config.engine.clone(),
            scratch_root: config.storage.scratch_root.clone(),
            sessions: Arc::new(SessionStore::new(config.storage.session_root.clone())),
            registry: Arc::new(ChannelRegistry::new()),
            models,
            outputters,
            uncertainty: None,
        }
    }

    /// Establish uncertainty workers from `source` for capable models.
    #[must_use]
    pub fn with_uncertainty(mut self, source: Arc<dyn UncertaintySource>) -> Self {
        self.uncertainty = Some(source);
        self
    }

    /// The channel registry.
    pub const fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    /// All live sessions.
    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// The engine's stepping policy.
    pub const fn policy(&self) -> &EngineConfig {
        &self.policy
    }

    /// The live session with this id. Sessions exist from [`Engine::connect`]
    /// until they are idle again.
    pub fn session(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(id)
    }

    // -----------------------------------------------------------------------
    // Channels
    // -----------------------------------------------------------------------

    /// Bind a newly connected event channel to `session`.
    pub fn connect(&self, session: SessionId, sender: ChannelSender) -> ChannelId {
        let channel = ChannelId::new();
        // Bound before the session exists so a concurrent eviction sees it.
        self.registry.bind(session, channel, sender);
        self.sessions.get_or_create(session);
        channel
    }

    /// Forget a disconnected channel. An active run keeps going.
    ///
    /// A session left with neither a channel nor a run is evicted. A run
    /// still in flight evicts its session when it ends.
    pub fn disconnect(&self, session: SessionId, channel: ChannelId) {
        if !self.registry.unbind(session, channel) {
            return;
        }
        let registry = &self.registry;
        let evicted = self.sessions.remove_if(session, || {
            registry.resolve(session).is_none() && !registry.is_active(session)
        });
        if evicted.is_some() {
            info!(%session, sessions = self.sessions.len(), "idle session evicted");
        }
    }

    // -----------------------------------------------------------------------
    // Models
    // -----------------------------------------------------------------------

    /// The session's model, asking the provider for one if none is installed.
    pub fn active_model(&self, id: SessionId) -> Option<SharedModel> {
        let session = self.session(id)?;
        if let Some(model) = session.model() {
            return Some(model);
        }
        let model = self.models.provide(id)?;
        session.install_model(SharedModel::clone(&model));
        Some(model)
    }

    /// Install (or replace) the session's model.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NoChannel`] if the session is not connected.
    pub fn install_model(&self, id: SessionId, model: SharedModel) -> Result<(), EngineError> {
        let session = self
            .session(id)
            .ok_or(EngineError::NoChannel { session: id })?;
        session.install_model(model);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Start a streaming run sending full output for every step.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NoChannel`] if the session has no event
    /// channel, or [`EngineError::NoModel`] if it has no model.
    pub fn run_model(&self, id: SessionId) -> Result<RunStart, EngineError> {
        self.start_run(id, RunMode::Stream, Vec::new())
    }

    /// Start an export run writing through temporary outputters.
    ///
    /// Outputters are only built if the run actually starts.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NoChannel`], [`EngineError::NoModel`], or
    /// [`EngineError::Export`] if the outputters cannot be prepared.
    pub async fn run_export(
        &self,
        id: SessionId,
        request: &ExportRequest,
    ) -> Result<RunStart, EngineError> {
        let (session, model) = self.prerequisites(id)?;
        let Some(reservation) = self.registry.reserve(id) else {
            return Ok(RunStart::AlreadyRunning);
        };

        let coordinator = {
            let mut guard = model.lock().await;
            ExportCoordinator::prepare(
                request,
                &mut **guard,
                self.outputters.as_ref(),
                self.scratch_root.as_deref(),
            )?
        };
        info!(session = %id, model_name = %request.model_name, outputters = request.outputters.len(), "export run requested");

        let finalizers: Vec<Box<dyn RunFinalizer>> = vec![Box::new(coordinator)];
        Ok(self.launch(reservation, session, model, RunMode::Export, finalizers))
    }

    /// Start a run in `mode` with cleanup `finalizers`.
    ///
    /// A request while a run is active is ignored and changes nothing.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NoChannel`] if the session has no event
    /// channel, or [`EngineError::NoModel`] if it has no model.
    pub fn start_run(
        &self,
        id: SessionId,
        mode: RunMode,
        finalizers: Vec<Box<dyn RunFinalizer>>,
    ) -> Result<RunStart, EngineError> {
        let (session, model) = self.prerequisites(id)?;
        let Some(reservation) = self.registry.reserve(id) else {
            return Ok(RunStart::AlreadyRunning);
        };
        Ok(self.launch(reservation, session, model, mode, finalizers))
    }

    fn prerequisites(&self, id: SessionId) -> Result<(Arc<Session>, SharedModel), EngineError> {
        let session = self
            .registry
            .resolve(id)
            .and_then(|_| self.session(id))
            .ok_or(EngineError::NoChannel { session: id })?;
        let model = self
            .active_model(id)
            .ok_or(EngineError::NoModel { session: id })?;
        Ok((session, model))
    }

    fn launch(
        &self,
        reservation: RunReservation,
        session: Arc<Session>,
        model: SharedModel,
        mode: RunMode,
        finalizers: Vec<Box<dyn RunFinalizer>>,
    ) -> RunStart {
        session.set_num_sent(0);
        session.gate().clear();

        let ctx = RunContext {
            run: reservation.run_id(),
            session,
            registry: Arc::clone(&self.registry),
            model,
        };
        let id = reservation.session();
        let task = StepTask::new(ctx, mode, self.policy.clone(), reservation.token())
            .with_uncertainty(self.uncertainty.clone())
            .with_finalizers(finalizers);
        let sessions = Arc::clone(&self.sessions);
        let registry = Arc::clone(&self.registry);
        RunStart::Started(reservation.launch(async move {
            let report = task.run().await;
            // The slot is still held here, so only the channel decides.
            if sessions
                .remove_if(id, || registry.resolve(id).is_none())
                .is_some()
            {
                info!(session = %id, "session evicted after its run");
            }
            report
        }))
    }

    /// Request cooperative cancellation of the session's run.
    ///
    /// Returns whether a run was active.
    pub fn kill(&self, id: SessionId) -> bool {
        self.registry.kill(id)
    }

    /// Acknowledge `prepared` or the last step, letting the run proceed.
    pub fn acknowledge(&self, id: SessionId) {
        match self.session(id) {
            Some(session) => session.gate().set(),
            None => debug!(session = %id, "ack for unknown session ignored"),
        }
    }

    /// Switch the session's free-run mode.
    pub fn set_free_run(&self, id: SessionId, enabled: bool) {
        match self.session(id) {
            Some(session) => {
                info!(session = %id, enabled, "free-run mode changed");
                session.set_free_run(enabled);
            }
            None => debug!(session = %id, "free-run change for unknown session ignored"),
        }
    }

    /// Rewind the session's model outside a run.
    ///
    /// Holds the session lock throughout. An active run is cancelled
    /// without waiting for it, and the step counter is reset first.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NoModel`] if the session is unknown or has
    /// no model, or [`EngineError::Rewind`] if the model cannot be rewound.
    pub async fn rewind(&self, id: SessionId) -> Result<(), EngineError> {
        let session = self
            .session(id)
            .ok_or(EngineError::NoModel { session: id })?;
        let model = self
            .active_model(id)
            .ok_or(EngineError::NoModel { session: id })?;

        let _guard = session.lock().await;
        info!(session = %id, "session lock acquired for rewind");
        if self.registry.kill(id) {
            session.set_num_sent(0);
        }
        session.gate().clear();

        model.lock().await.rewind().map_err(EngineError::Rewind)?;
        info!(session = %id, "model rewound");
        Ok(())
    }

    /// Path of an exported artifact in the session directory.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Export`] if `filename` is not a plain file
    /// name, or [`EngineError::NotFound`] if no such file exists.
    pub async fn export_path(&self, id: SessionId, filename: &str) -> Result<PathBuf, EngineError> {
        let name = plain_file_name(filename).ok_or_else(|| ExportError::InvalidFilename {
            name: filename.to_owned(),
        })?;
        let path = self.sessions.dir_for(id).join(name);
        let exists = tokio::fs::try_exists(&path)
            .await
            .map_err(|source| EngineError::Io {
                path: path.clone(),
                source,
            })?;
        if exists {
            Ok(path)
        } else {
            Err(EngineError::NotFound {
                name: name.to_owned(),
            })
        }
    }
}

impl core::fmt::Debug for Engine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Engine")
            .field("policy", &self.policy)
            .field("sessions", &self.sessions.len())
            .field("active_runs", &self.registry.active_count())
            .finish_non_exhaustive()
    }
}
