//! Per-session state shared by the step task and administrative operations.
//!
//! A [`Session`] owns its [`Gate`], free-run flag, the mutual-exclusion lock
//! that guards out-of-band model mutation (rewind), a small auxiliary
//! key/value store, the installed model and the uncertainty-worker slot.
//!
//! The step task owns the gate and auxiliary store for the duration of a
//! run, but administrative operations (rewind, acknowledgements, kill) are
//! allowed to write them too. Nothing here is ever shared across sessions.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use driftline_types::SessionId;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use crate::gate::Gate;
use crate::model::{SharedModel, UncertaintyWorkers};

/// Auxiliary key holding the number of steps sent in the current run.
pub const NUM_SENT_KEY: &str = "num_sent";

/// Auxiliary per-session key/value state.
pub type AuxState = BTreeMap<String, Value>;

/// One client session.
pub struct Session {
    id: SessionId,
    gate: Gate,
    free_run: AtomicBool,
    lock: tokio::sync::Mutex<()>,
    aux: Mutex<AuxState>,
    model: RwLock<Option<SharedModel>>,
    uncertainty: Mutex<Option<Box<dyn UncertaintyWorkers>>>,
    dir: PathBuf,
}

impl Session {
    /// Create a session whose persistent directory is `dir`.
    pub fn new(id: SessionId, dir: PathBuf) -> Self {
        let mut aux = AuxState::new();
        aux.insert(NUM_SENT_KEY.to_owned(), Value::from(0_u64));
        Self {
            id,
            gate: Gate::new(),
            free_run: AtomicBool::new(false),
            lock: tokio::sync::Mutex::new(()),
            aux: Mutex::new(aux),
            model: RwLock::new(None),
            uncertainty: Mutex::new(None),
            dir,
        }
    }

    /// The session identifier.
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// The session's pacing gate.
    pub const fn gate(&self) -> &Gate {
        &self.gate
    }

    /// The session's persistent directory (export artifacts land here).
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    // -----------------------------------------------------------------------
    // Free-run mode
    // -----------------------------------------------------------------------

    /// Whether the step task keeps stepping without per-step acknowledgement.
    pub fn is_free_run(&self) -> bool {
        self.free_run.load(Ordering::Acquire)
    }

    /// Switch free-run mode on or off.
    pub fn set_free_run(&self, enabled: bool) {
        self.free_run.store(enabled, Ordering::Release);
    }

    // -----------------------------------------------------------------------
    // Mutual exclusion for out-of-band model mutation
    // -----------------------------------------------------------------------

    /// Acquire the session lock. Released when the guard drops.
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.lock.lock().await
    }

    // -----------------------------------------------------------------------
    // Auxiliary state
    // -----------------------------------------------------------------------

    /// A copy of the auxiliary state.
    pub fn aux_snapshot(&self) -> AuxState {
        self.aux.lock().clone()
    }

    /// Read one auxiliary value.
    pub fn aux(&self, key: &str) -> Option<Value> {
        self.aux.lock().get(key).cloned()
    }

    /// Write one auxiliary value.
    pub fn set_aux(&self, key: &str, value: Value) {
        self.aux.lock().insert(key.to_owned(), value);
    }

    /// Steps sent in the current (or last) run.
    pub fn num_sent(&self) -> u64 {
        self.aux(NUM_SENT_KEY)
            .and_then(|v| v.as_u64())
            .unwrap_or_default()
    }

    /// Overwrite the step counter.
    pub fn set_num_sent(&self, value: u64) {
        self.set_aux(NUM_SENT_KEY, Value::from(value));
    }

    // -----------------------------------------------------------------------
    // Model
    // -----------------------------------------------------------------------

    /// The installed model, if any.
    pub fn model(&self) -> Option<SharedModel> {
        self.model.read().clone()
    }

    /// Install (or replace) the session's model.
    pub fn install_model(&self, model: SharedModel) {
        *self.model.write() = Some(model);
    }

    // -----------------------------------------------------------------------
    // Uncertainty workers
    // -----------------------------------------------------------------------

    /// Replace the uncertainty-worker set.
    pub fn set_uncertainty_workers(&self, workers: Box<dyn UncertaintyWorkers>) {
        *self.uncertainty.lock() = Some(workers);
    }

    /// Tear down the uncertainty-worker set, if any.
    pub fn drop_uncertainty_workers(&self) {
        self.uncertainty.lock().take();
    }

    /// Whether an uncertainty-worker set is established.
    pub fn has_uncertainty_workers(&self) -> bool {
        self.uncertainty.lock().is_some()
    }

    /// Run `f` against the established worker set.
    ///
    /// Returns `None` when no worker set exists.
    pub fn with_uncertainty_workers<R>(
        &self,
        f: impl FnOnce(&mut dyn UncertaintyWorkers) -> R,
    ) -> Option<R> {
        let mut slot = self.uncertainty.lock();
        let workers = slot.as_mut()?;
        Some(f(workers.as_mut()))
    }
}

impl core::fmt::Debug for Session {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("free_run", &self.is_free_run())
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

/// A difference between the expected and the actual auxiliary state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuxChange {
    /// The key that differs.
    pub key: String,
    /// What the run expected the key to hold.
    pub expected: Option<Value>,
    /// What the key actually holds.
    pub actual: Option<Value>,
}

/// Keys whose values differ between `expected` and `actual`.
pub fn diff_aux(expected: &AuxState, actual: &AuxState) -> Vec<AuxChange> {
    let keys: BTreeSet<&String> = expected.keys().chain(actual.keys()).collect();
    keys.into_iter()
        .filter_map(|key| {
            let before = expected.get(key);
            let after = actual.get(key);
            (before != after).then(|| AuxChange {
                key: key.clone(),
                expected: before.cloned(),
                actual: after.cloned(),
            })
        })
        .collect()
}

/// All live sessions.
///
/// Sessions are created when a client connects and evicted once they have
/// neither a channel nor an active run.
#[derive(Debug)]
pub struct SessionStore {
    root: PathBuf,
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
}

impl SessionStore {
    /// Create a store placing session directories under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Look up a session without creating it.
    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.read().get(&id).cloned()
    }

    /// Look up a session, creating it if needed.
    pub fn get_or_create(&self, id: SessionId) -> Arc<Session> {
        if let Some(session) = self.get(id) {
            return session;
        }
        let mut sessions = self.sessions.write();
        Arc::clone(
            sessions
                .entry(id)
                .or_insert_with(|| Arc::new(Session::new(id, self.dir_for(id)))),
        )
    }

    /// The persistent directory of session `id`, whether or not it is live.
    pub fn dir_for(&self, id: SessionId) -> PathBuf {
        self.root.join(id.to_string())
    }

    /// Forget a session if `idle` still holds under the store's write lock.
    pub fn remove_if(&self, id: SessionId, idle: impl FnOnce() -> bool) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(&id) && idle() {
            sessions.remove(&id)
        } else {
            None
        }
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    /// Whether no sessions exist.
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}
