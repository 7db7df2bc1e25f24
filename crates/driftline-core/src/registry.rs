//! Channel registry: session-to-channel bindings and the active-run table.
//!
//! The registry resolves a session to the event channel its client is
//! connected on, delivers [`ChannelEvent`]s to that channel, and owns the
//! table of running step tasks. It enforces the central invariant that a
//! session has at most one active run: [`ChannelRegistry::reserve`] is an
//! atomic check-and-insert, and a second request while a run is active
//! gets `None` (the request is ignored, never queued).
//!
//! Event channels are bounded. A client that falls behind holds the emitting
//! run back until it catches up, for at most [`LAG_LIMIT`] per event.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use driftline_types::{ChannelEvent, ChannelId, RunId, SessionId};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::step::RunReport;

/// Number of events a client's channel buffers before emitters wait.
pub const CHANNEL_CAPACITY: usize = 256;

/// How long an emitter waits on a full channel before dropping the event.
pub const LAG_LIMIT: Duration = Duration::from_secs(30);

/// Sending half of a client's event channel.
pub type ChannelSender = mpsc::Sender<ChannelEvent>;

/// Receiving half of a client's event channel.
pub type ChannelReceiver = mpsc::Receiver<ChannelEvent>;

/// Create a new event channel pair.
pub fn channel() -> (ChannelSender, ChannelReceiver) {
    mpsc::channel(CHANNEL_CAPACITY)
}

#[derive(Debug)]
struct Binding {
    channel: ChannelId,
    sender: ChannelSender,
}

#[derive(Debug)]
struct ActiveRun {
    run: RunId,
    token: CancellationToken,
    handle: Option<JoinHandle<RunReport>>,
}

/// Maps sessions to channels and tracks the single active run per session.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    bindings: RwLock<HashMap<SessionId, Binding>>,
    runs: Mutex<HashMap<SessionId, ActiveRun>>,
}

impl ChannelRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    // -----------------------------------------------------------------------
    // Channel bindings
    // -----------------------------------------------------------------------

    /// Bind `session` to a newly connected channel.
    ///
    /// Returns the channel it replaces, if the session was already bound.
    pub fn bind(
        &self,
        session: SessionId,
        channel: ChannelId,
        sender: ChannelSender,
    ) -> Option<ChannelId> {
        let previous = self
            .bindings
            .write()
            .insert(session, Binding { channel, sender })
            .map(|b| b.channel);
        info!(%session, %channel, replaced = ?previous, "channel bound");
        previous
    }

    /// Remove the binding for `session` if it still names `channel`.
    ///
    /// A client that reconnected has already replaced the binding, in which
    /// case the stale disconnect is ignored.
    pub fn unbind(&self, session: SessionId, channel: ChannelId) -> bool {
        let mut bindings = self.bindings.write();
        let current = bindings.get(&session).map(|b| b.channel);
        if current == Some(channel) {
            bindings.remove(&session);
            info!(%session, %channel, "channel unbound");
            true
        } else {
            false
        }
    }

    /// The channel `session` is currently bound to.
    pub fn resolve(&self, session: SessionId) -> Option<ChannelId> {
        self.bindings.read().get(&session).map(|b| b.channel)
    }

    /// The session bound to `channel`.
    pub fn session_for(&self, channel: ChannelId) -> Option<SessionId> {
        self.bindings
            .read()
            .iter()
            .find_map(|(session, b)| (b.channel == channel).then_some(*session))
    }

    /// Deliver `event` to the channel `session` is bound to right now.
    ///
    /// Returns whether the event was handed to a live channel. Events for
    /// sessions without a channel are dropped. When the channel is full the
    /// call waits for the client, up to [`LAG_LIMIT`].
    pub async fn emit(&self, session: SessionId, event: ChannelEvent) -> bool {
        let name = event.name();
        let Some((channel, sender)) = self
            .bindings
            .read()
            .get(&session)
            .map(|b| (b.channel, b.sender.clone()))
        else {
            debug!(%session, event = name, "no channel bound, event dropped");
            return false;
        };

        let permit = match sender.try_reserve() {
            Ok(permit) => permit,
            Err(mpsc::error::TrySendError::Full(())) => {
                warn!(%session, %channel, event = name, "event channel lagging, waiting for client");
                match tokio::time::timeout(LAG_LIMIT, sender.reserve()).await {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(_closed)) => {
                        debug!(%session, %channel, event = name, "channel closed, event dropped");
                        return false;
                    }
                    Err(_elapsed) => {
                        warn!(%session, %channel, event = name, "event channel stalled, event dropped");
                        return false;
                    }
                }
            }
            Err(mpsc::error::TrySendError::Closed(())) => {
                debug!(%session, %channel, event = name, "channel closed, event dropped");
                return false;
            }
        };
        permit.send(event);
        trace!(%session, %channel, event = name, "event emitted");
        true
    }

    // -----------------------------------------------------------------------
    // Active runs
    // -----------------------------------------------------------------------

    /// Reserve the run slot for `session`.
    ///
    /// Returns `None` if a run is already active (or reserved) for the
    /// session. The reservation frees the slot if dropped without being
    /// launched.
    pub fn reserve(self: &Arc<Self>, session: SessionId) -> Option<RunReservation> {
        let mut runs = self.runs.lock();
        if let Some(active) = runs.get(&session) {
            info!(%session, run = %active.run, "run already active, request ignored");
            return None;
        }
        let run = RunId::new();
        let token = CancellationToken::new();
        runs.insert(
            session,
            ActiveRun {
                run,
                token: token.clone(),
                handle: None,
            },
        );
        debug!(%session, %run, "run slot reserved");
        Some(RunReservation {
            registry: Arc::clone(self),
            session,
            run,
            token,
            launched: false,
        })
    }

    /// Request cooperative cancellation of the session's active run.
    ///
    /// Does not wait for the run to stop. Returns whether a run was active.
    pub fn kill(&self, session: SessionId) -> bool {
        let runs = self.runs.lock();
        match runs.get(&session) {
            Some(active) => {
                info!(%session, run = %active.run, "kill requested");
                active.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every active run. Returns how many were cancelled.
    pub fn kill_all(&self) -> usize {
        let runs = self.runs.lock();
        for active in runs.values() {
            active.token.cancel();
        }
        runs.len()
    }

    /// Whether `session` has an active run.
    pub fn is_active(&self, session: SessionId) -> bool {
        self.runs.lock().contains_key(&session)
    }

    /// The id of the session's active run.
    pub fn active_run(&self, session: SessionId) -> Option<RunId> {
        self.runs.lock().get(&session).map(|a| a.run)
    }

    /// Number of sessions with an active run.
    pub fn active_count(&self) -> usize {
        self.runs.lock().len()
    }

    /// Wait for the session's active run to finish and return its report.
    ///
    /// Returns `None` if no launched run is active, or another caller is
    /// already joining it.
    pub async fn join(&self, session: SessionId) -> Option<Result<RunReport, JoinError>> {
        let handle = self
            .runs
            .lock()
            .get_mut(&session)
            .and_then(|a| a.handle.take())?;
        Some(handle.await)
    }

    fn attach_handle(&self, session: SessionId, run: RunId, handle: JoinHandle<RunReport>) {
        let mut runs = self.runs.lock();
        if let Some(active) = runs.get_mut(&session).filter(|a| a.run == run) {
            active.handle = Some(handle);
        }
    }

    fn release(&self, session: SessionId, run: RunId) {
        let mut runs = self.runs.lock();
        if runs.get(&session).is_some_and(|a| a.run == run) {
            runs.remove(&session);
            debug!(%session, %run, "run slot released");
        }
    }
}

/// The right to start the single run of a session.
///
/// Obtained from [`ChannelRegistry::reserve`]. Launching spawns the run on
/// the Tokio runtime; the slot is released when the spawned task ends,
/// including by panic. Dropping an unlaunched reservation releases the slot
/// immediately.
#[derive(Debug)]
pub struct RunReservation {
    registry: Arc<ChannelRegistry>,
    session: SessionId,
    run: RunId,
    token: CancellationToken,
    launched: bool,
}

impl RunReservation {
    /// The id assigned to the reserved run.
    pub const fn run_id(&self) -> RunId {
        self.run
    }

    /// The reserved session.
    pub const fn session(&self) -> SessionId {
        self.session
    }

    /// The run's cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Spawn the run.
    pub fn launch<F>(mut self, task: F) -> RunId
    where
        F: Future<Output = RunReport> + Send + 'static,
    {
        let guard = ReleaseGuard {
            registry: Arc::clone(&self.registry),
            session: self.session,
            run: self.run,
        };
        let handle = tokio::spawn(async move {
            let _guard = guard;
            task.await
        });
        self.registry.attach_handle(self.session, self.run, handle);
        self.launched = true;
        info!(session = %self.session, run = %self.run, "run launched");
        self.run
    }
}

impl Drop for RunReservation {
    fn drop(&mut self) {
        if !self.launched {
            self.registry.release(self.session, self.run);
        }
    }
}

/// Frees a run slot when the spawned task finishes or unwinds.
struct ReleaseGuard {
    registry: Arc<ChannelRegistry>,
    session: SessionId,
    run: RunId,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.registry.release(self.session, self.run);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::step::{RunOutcome, RunReport};

    fn report(run: RunId) -> RunReport {
        RunReport {
            run,
            outcome: RunOutcome::Completed,
            steps_sent: 0,
            finalizer_errors: Vec::new(),
        }
    }

    fn explode(run: RunId) -> RunReport {
        panic!("run {run} exploded")
    }

    #[test]
    fn resolve_requires_binding() {
        let registry = ChannelRegistry::new();
        let session = SessionId::new();
        assert!(registry.resolve(session).is_none());

        let (tx, _rx) = channel();
        let channel_id = ChannelId::new();
        registry.bind(session, channel_id, tx);
        assert_eq!(registry.resolve(session), Some(channel_id));
        assert_eq!(registry.session_for(channel_id), Some(session));
    }

    #[test]
    fn stale_unbind_is_ignored() {
        let registry = ChannelRegistry::new();
        let session = SessionId::new();
        let (old_tx, _old_rx) = channel();
        let (new_tx, _new_rx) = channel();
        let old = ChannelId::new();
        let new = ChannelId::new();
        registry.bind(session, old, old_tx);
        assert_eq!(registry.bind(session, new, new_tx), Some(old));
        assert!(!registry.unbind(session, old));
        assert_eq!(registry.resolve(session), Some(new));
        assert!(registry.unbind(session, new));
        assert!(registry.resolve(session).is_none());
    }

    #[tokio::test]
    async fn emit_reaches_current_channel() {
        let registry = ChannelRegistry::new();
        let session = SessionId::new();
        assert!(!registry.emit(session, ChannelEvent::Prepared).await);

        let (tx, mut rx) = channel();
        registry.bind(session, ChannelId::new(), tx);
        assert!(registry.emit(session, ChannelEvent::Prepared).await);
        assert_eq!(rx.try_recv().ok(), Some(ChannelEvent::Prepared));
    }

    fn fill(tx: &ChannelSender) {
        for _ in 0..CHANNEL_CAPACITY {
            tx.try_send(ChannelEvent::Prepared).unwrap();
        }
    }

    #[tokio::test]
    async fn emit_waits_for_a_lagging_client() {
        let registry = Arc::new(ChannelRegistry::new());
        let session = SessionId::new();
        let (tx, mut rx) = channel();
        fill(&tx);
        registry.bind(session, ChannelId::new(), tx);

        let pending = tokio::spawn({
            let registry = Arc::clone(&registry);
            async move { registry.emit(session, ChannelEvent::ExportFailed).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished());

        assert_eq!(rx.recv().await, Some(ChannelEvent::Prepared));
        assert!(pending.await.unwrap());
        let mut last = None;
        while let Ok(event) = rx.try_recv() {
            last = Some(event);
        }
        assert_eq!(last, Some(ChannelEvent::ExportFailed));
    }

    #[tokio::test(start_paused = true)]
    async fn emit_gives_up_on_a_stalled_client() {
        let registry = ChannelRegistry::new();
        let session = SessionId::new();
        let (tx, _rx) = channel();
        fill(&tx);
        registry.bind(session, ChannelId::new(), tx);

        assert!(!registry.emit(session, ChannelEvent::ExportFailed).await);
    }

    #[test]
    fn second_reservation_is_refused() {
        let registry = Arc::new(ChannelRegistry::new());
        let session = SessionId::new();
        let first = registry.reserve(session);
        assert!(first.is_some());
        assert!(registry.reserve(session).is_none());
        assert!(registry.is_active(session));

        // Other sessions are unaffected.
        assert!(registry.reserve(SessionId::new()).is_some());
    }

    #[test]
    fn dropping_unlaunched_reservation_frees_slot() {
        let registry = Arc::new(ChannelRegistry::new());
        let session = SessionId::new();
        drop(registry.reserve(session));
        assert!(!registry.is_active(session));
        assert!(registry.reserve(session).is_some());
    }

    #[tokio::test]
    async fn launched_run_releases_slot_when_done() {
        let registry = Arc::new(ChannelRegistry::new());
        let session = SessionId::new();
        let reservation = registry.reserve(session).unwrap();
        let run = reservation.run_id();
        reservation.launch(async move { report(run) });

        let joined = registry.join(session).await;
        assert_eq!(joined.unwrap().unwrap().run, run);
        assert!(!registry.is_active(session));
    }

    #[tokio::test]
    async fn kill_cancels_token_without_blocking() {
        let registry = Arc::new(ChannelRegistry::new());
        let session = SessionId::new();
        let reservation = registry.reserve(session).unwrap();
        let token = reservation.token();
        let run = reservation.run_id();
        reservation.launch(async move {
            token.cancelled().await;
            report(run)
        });

        assert!(registry.kill(session));
        let joined = tokio::time::timeout(Duration::from_secs(1), registry.join(session)).await;
        assert!(joined.is_ok());
        assert!(!registry.kill(session));
    }

    #[test]
    fn kill_all_cancels_every_reservation() {
        let registry = Arc::new(ChannelRegistry::new());
        let first = registry.reserve(SessionId::new()).unwrap();
        let second = registry.reserve(SessionId::new()).unwrap();

        assert_eq!(registry.kill_all(), 2);
        assert!(first.token().is_cancelled());
        assert!(second.token().is_cancelled());
    }

    #[tokio::test]
    async fn panicking_run_still_releases_slot() {
        let registry = Arc::new(ChannelRegistry::new());
        let session = SessionId::new();
        let reservation = registry.reserve(session).unwrap();
        let run = reservation.run_id();
        reservation.launch(async move { explode(run) });

        let joined = registry.join(session).await.unwrap();
        assert!(joined.is_err());
        assert!(!registry.is_active(session));
    }
}
