//! # Connection signal fan-out.
//!
//! [`Signals`] is a thin wrapper around [`tokio::sync::broadcast`] carrying
//! [`ConnectionEvent`]s from a bus client's connection task to whoever watches
//! it (the worker logs them).
//!
//! ## Rules
//! - **Non-blocking publish**: a client never waits on its observers.
//! - **Fire-and-forget**: with no receiver the event is dropped.
//! - **Lag**: a slow receiver observes `RecvError::Lagged(n)` and skips `n` events.

use tokio::sync::broadcast;

use super::ConnectionEvent;

/// Broadcast channel for connection lifecycle events. Cheap to clone.
#[derive(Clone, Debug)]
pub struct Signals {
    tx: broadcast::Sender<ConnectionEvent>,
}

impl Signals {
    /// Creates a channel keeping at most `capacity` (min 1) undelivered events.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, ev: ConnectionEvent) {
        let _ = self.tx.send(ev);
    }

    /// Receiver observing events sent from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.tx.subscribe()
    }
}

impl Default for Signals {
    fn default() -> Self {
        Self::new(64)
    }
}
