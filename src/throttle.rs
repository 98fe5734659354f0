//! # Report throttle.
//!
//! [`Throttle`] turns a stream of "something happened" notifications into
//! periodic flushes. One instance lives at every reporting site: each worker
//! throttles its `report` envelopes, the supervisor throttles its console line.
//!
//! ## Timing rules
//! ```text
//! notify() with nothing pending ──► pending_since = now
//! deadline = max(pending_since, last_flush + min_delay)
//!            capped at pending_since + max_delay
//! now >= deadline ──► try_flush() == true, pending cleared, last_flush = now
//! force_flush()   ──► always flushes, pending or not (used once, at shutdown)
//! ```
//!
//! - Two flushes are never closer than `min_delay`, unless one is forced.
//! - A pending notification never waits longer than `max_delay`.
//! - A quiet stream that gets one notification flushes within `min_delay`.
//!
//! The throttle owns no callback and no counters: the owner keeps its own
//! state, awaits [`Throttle::due`] inside its event loop, and emits/resets its
//! counters whenever [`Throttle::try_flush`] says so. This keeps all mutation on
//! the owner's single event-loop turn.

use std::time::Duration;

use tokio::time::{Instant, sleep_until};

/// Coalescing flush timer with a lower (`min_delay`) and upper (`max_delay`) bound.
#[derive(Debug, Clone)]
pub struct Throttle {
    min_delay: Duration,
    max_delay: Duration,
    last_flush_at: Option<Instant>,
    pending_since: Option<Instant>,
}

impl Throttle {
    /// Creates an idle throttle.
    ///
    /// `max_delay` lower than `min_delay` is raised to `min_delay`; configuration
    /// validation rejects such bounds before they get here.
    pub fn new(min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            min_delay,
            max_delay: max_delay.max(min_delay),
            last_flush_at: None,
            pending_since: None,
        }
    }

    /// Records that a reportable event occurred.
    pub fn notify(&mut self, now: Instant) {
        if self.pending_since.is_none() {
            self.pending_since = Some(now);
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending_since.is_some()
    }

    /// Instant at which the pending notification becomes due, if any.
    pub fn deadline(&self) -> Option<Instant> {
        let pending = self.pending_since?;
        let earliest = match self.last_flush_at {
            Some(last) => pending.max(last + self.min_delay),
            None => pending,
        };
        Some(earliest.min(pending + self.max_delay))
    }

    /// Flushes if a notification is pending and due; returns whether it did.
    pub fn try_flush(&mut self, now: Instant) -> bool {
        match self.deadline() {
            Some(deadline) if deadline <= now => {
                self.mark_flushed(now);
                true
            }
            _ => false,
        }
    }

    /// Flushes unconditionally, bypassing all timing.
    pub fn force_flush(&mut self, now: Instant) {
        self.mark_flushed(now);
    }

    /// Completes when the pending notification is due; never completes while idle.
    ///
    /// Cancel-safe: it only sleeps, so it can be re-created every loop turn.
    pub async fn due(&self) {
        match self.deadline() {
            Some(deadline) => sleep_until(deadline).await,
            None => std::future::pending::<()>().await,
        }
    }

    fn mark_flushed(&mut self, now: Instant) {
        self.last_flush_at = Some(now);
        self.pending_since = None;
    }
}
