//! Per-session pacing signal.
//!
//! A [`Gate`] is a waitable boolean. The client opens it (via an `ack`
//! message) to let a prepared run start, and again after every step to
//! permit the next one. The step task clears it after emitting a step
//! unless the session is in free-run mode.
//!
//! The same gate serves as the start barrier and the per-step throttle, so
//! "the client must acknowledge to proceed" reads the same at both call
//! sites.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;

/// A waitable binary signal with timeout.
///
/// Only one task ever waits on a given session's gate, but any number of
/// administrative callers may set or clear it.
#[derive(Debug, Default)]
pub struct Gate {
    /// Whether the gate is currently open.
    ready: AtomicBool,

    /// Wakes a waiter when the gate is opened.
    notify: Notify,
}

impl Gate {
    /// Create a closed gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the gate and wake the waiter, if any.
    pub fn set(&self) {
        self.ready.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Close the gate.
    pub fn clear(&self) {
        self.ready.store(false, Ordering::Release);
    }

    /// Whether the gate is currently open.
    pub fn is_set(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Wait until the gate is open or `timeout` elapses.
    ///
    /// Returns `true` if the gate was (or became) open, `false` on timeout.
    /// Waiting does not close the gate.
    pub async fn wait(&self, timeout: Duration) -> bool {
        let opened = async {
            loop {
                let notified = self.notify.notified();
                tokio::pin!(notified);
                // Register before checking the flag so a `set` racing with
                // this check is not lost.
                notified.as_mut().enable();
                if self.is_set() {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, opened).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn open_gate_returns_immediately() {
        let gate = Gate::new();
        gate.set();
        assert!(gate.wait(Duration::from_millis(1)).await);
        // Waiting does not consume the signal.
        assert!(gate.is_set());
    }

    #[tokio::test]
    async fn closed_gate_times_out() {
        let gate = Gate::new();
        assert!(!gate.wait(Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn set_wakes_waiter() {
        let gate = Arc::new(Gate::new());
        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.wait(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        gate.set();
        assert!(matches!(waiter.await, Ok(true)));
    }

    #[tokio::test]
    async fn clear_closes_gate() {
        let gate = Gate::new();
        gate.set();
        gate.clear();
        assert!(!gate.is_set());
        assert!(!gate.wait(Duration::from_millis(10)).await);
    }
}
