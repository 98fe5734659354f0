//! # Deferred acknowledgements.
//!
//! [`DeferredAcks`] keeps delivered units open for an `ack_delay`, renewing
//! their lease every `remind_interval`, then finishes them. It simulates a
//! slow consumer without blocking the consumer's event loop.
//!
//! ```text
//! hold(unit, D, R) ──► Renew @ +R, +2R, ... (strictly before +D) ──► unit.touch()
//!                  └─► Finalize @ +D ──► drop pending renewal ──► unit.finish()
//! hold(unit, 0|None, _) ──► unit.finish() right away, nothing scheduled
//! ```
//!
//! ## Rules
//! - A held unit ends exactly once: finalized by its timer, by
//!   [`DeferredAcks::finalize_all`], or handed back by [`DeferredAcks::cancel`].
//! - No renewal fires after a unit ended.
//! - Timers are driven by the owner: await [`DeferredAcks::next_fired`] in the
//!   event loop. It is cancel-safe and pends forever while nothing is held.

use std::collections::HashMap;
use std::time::Duration;

use futures::StreamExt;
use tokio::time::Instant;
use tokio_util::time::DelayQueue;
use tokio_util::time::delay_queue::Key;

use crate::bus::Delivery;

/// Handle of a held unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AckId(u64);

/// Outcome of [`DeferredAcks::hold`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Hold {
    /// No delay configured; the unit was finished synchronously.
    Finalized,
    /// The unit is held until its deadline.
    Held(AckId),
}

/// A timer that went off.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fired {
    Renewed(AckId),
    Finalized(AckId),
}

#[derive(Debug)]
enum Timer {
    Renew(AckId),
    Finalize(AckId),
}

struct Held {
    unit: Box<dyn Delivery>,
    deadline: Instant,
    remind: Option<Duration>,
    next_renew: Instant,
    renew_key: Option<Key>,
    finalize_key: Key,
}

/// Scheduler for units whose acknowledgement is deliberately delayed.
#[derive(Default)]
pub struct DeferredAcks {
    timers: DelayQueue<Timer>,
    held: HashMap<AckId, Held>,
    next_id: u64,
}

impl DeferredAcks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Holds `unit` for `ack_delay`, renewing it every `remind_interval`.
    ///
    /// A missing or zero `ack_delay` finishes the unit immediately. A missing or
    /// zero `remind_interval` disables renewals.
    pub fn hold(
        &mut self,
        unit: Box<dyn Delivery>,
        ack_delay: Option<Duration>,
        remind_interval: Option<Duration>,
    ) -> Hold {
        let Some(delay) = ack_delay.filter(|d| !d.is_zero()) else {
            unit.finish();
            return Hold::Finalized;
        };

        let id = AckId(self.next_id);
        self.next_id += 1;

        let now = Instant::now();
        let deadline = now + delay;
        let remind = remind_interval.filter(|r| !r.is_zero());
        let finalize_key = self.timers.insert_at(Timer::Finalize(id), deadline);

        let mut held = Held {
            unit,
            deadline,
            remind,
            next_renew: now,
            renew_key: None,
            finalize_key,
        };
        if let Some(interval) = remind {
            let at = now + interval;
            if at < deadline {
                held.next_renew = at;
                held.renew_key = Some(self.timers.insert_at(Timer::Renew(id), at));
            }
        }
        self.held.insert(id, held);
        Hold::Held(id)
    }

    /// Stops tracking `id` and hands its unit back without finishing it.
    pub fn cancel(&mut self, id: AckId) -> Option<Box<dyn Delivery>> {
        let held = self.held.remove(&id)?;
        if let Some(key) = held.renew_key {
            self.timers.try_remove(&key);
        }
        self.timers.try_remove(&held.finalize_key);
        Some(held.unit)
    }

    /// Finishes every held unit now, ignoring deadlines. Returns how many.
    pub fn finalize_all(&mut self) -> usize {
        self.timers.clear();
        let count = self.held.len();
        for (_, held) in self.held.drain() {
            held.unit.finish();
        }
        count
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    /// Waits for the next timer and applies it (touch or finish).
    pub async fn next_fired(&mut self) -> Fired {
        loop {
            if self.timers.is_empty() {
                std::future::pending::<()>().await;
            }
            let Some(expired) = self.timers.next().await else {
                continue;
            };
            if let Some(fired) = self.apply(expired.into_inner()) {
                return fired;
            }
        }
    }

    fn apply(&mut self, timer: Timer) -> Option<Fired> {
        match timer {
            Timer::Renew(id) => {
                let held = self.held.get_mut(&id)?;
                held.renew_key = None;
                held.unit.touch();

                if let Some(interval) = held.remind {
                    let at = held.next_renew + interval;
                    if at < held.deadline {
                        held.next_renew = at;
                        held.renew_key = Some(self.timers.insert_at(Timer::Renew(id), at));
                    }
                }
                Some(Fired::Renewed(id))
            }
            Timer::Finalize(id) => {
                let held = self.held.remove(&id)?;
                if let Some(key) = held.renew_key {
                    self.timers.try_remove(&key);
                }
                held.unit.finish();
                Some(Fired::Finalized(id))
            }
        }
    }
}
