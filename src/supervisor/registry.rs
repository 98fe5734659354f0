//! # Worker registry.
//!
//! Owns one [`WorkerDescriptor`] per live worker plus the id counter.
//!
//! ## Rules
//! - Ids are assigned monotonically and never reused within a run.
//! - A descriptor only moves forward: `spawned → started → ready → running`;
//!   `ended` is reachable from any state and removes the descriptor.
//! - Envelopes to a worker go through its outbox; a closed outbox (worker gone)
//!   is not an error.

use std::collections::BTreeMap;
use std::fmt;

use tokio::sync::mpsc;
use tracing::debug;

use super::launcher::WorkerHandle;
use crate::config::Role;
use crate::protocol::ToWorker;

/// Supervisor-side view of a worker's progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReadyState {
    Spawned,
    Started,
    Ready,
    Running,
    Ended,
}

impl ReadyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadyState::Spawned => "spawned",
            ReadyState::Started => "started",
            ReadyState::Ready => "ready",
            ReadyState::Running => "running",
            ReadyState::Ended => "ended",
        }
    }

    /// Whether `self → next` is a legal single step.
    fn allows(self, next: ReadyState) -> bool {
        match next {
            ReadyState::Ended => self != ReadyState::Ended,
            ReadyState::Spawned => false,
            _ => next as u8 == self as u8 + 1,
        }
    }
}

impl fmt::Display for ReadyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A launched worker, owned by the supervisor.
pub struct WorkerDescriptor {
    pub id: u32,
    pub alias: String,
    pub role: Role,
    state: ReadyState,
    outbox: mpsc::UnboundedSender<ToWorker>,
    handle: Option<WorkerHandle>,
}

impl WorkerDescriptor {
    pub(crate) fn new(
        id: u32,
        role: Role,
        outbox: mpsc::UnboundedSender<ToWorker>,
        handle: WorkerHandle,
    ) -> Self {
        Self {
            id,
            alias: format!("{}-{}", role.short(), id),
            role,
            state: ReadyState::Spawned,
            outbox,
            handle: Some(handle),
        }
    }

    pub fn state(&self) -> ReadyState {
        self.state
    }

    /// Moves to `next` if that is the following state; returns whether it did.
    pub(crate) fn advance(&mut self, next: ReadyState) -> bool {
        if !self.state.allows(next) {
            return false;
        }
        debug!(worker = %self.alias, from = %self.state, to = %next, "worker state");
        self.state = next;
        true
    }

    /// Queues `env` for the worker; false once its channel is gone.
    pub(crate) fn send(&self, env: ToWorker) -> bool {
        self.outbox.send(env).is_ok()
    }

    pub(crate) fn take_handle(&mut self) -> Option<WorkerHandle> {
        self.handle.take()
    }
}

/// Table of live workers.
#[derive(Default)]
pub struct Registry {
    workers: BTreeMap<u32, WorkerDescriptor>,
    next_id: u32,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves the next worker id.
    pub fn reserve_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub(crate) fn insert(&mut self, desc: WorkerDescriptor) {
        self.workers.insert(desc.id, desc);
    }

    pub fn get(&self, id: u32) -> Option<&WorkerDescriptor> {
        self.workers.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: u32) -> Option<&mut WorkerDescriptor> {
        self.workers.get_mut(&id)
    }

    /// Marks the worker ended and hands its descriptor back.
    pub(crate) fn deregister(&mut self, id: u32) -> Option<WorkerDescriptor> {
        let mut desc = self.workers.remove(&id)?;
        desc.advance(ReadyState::Ended);
        Some(desc)
    }

    /// Number of workers that have not ended.
    pub fn live(&self) -> usize {
        self.workers.len()
    }

    pub fn ready(&self) -> usize {
        self.workers
            .values()
            .filter(|w| w.state == ReadyState::Ready)
            .count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkerDescriptor> {
        self.workers.values()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut WorkerDescriptor> {
        self.workers.values_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(reg: &mut Registry, role: Role) -> (u32, mpsc::UnboundedReceiver<ToWorker>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = reg.reserve_id();
        reg.insert(WorkerDescriptor::new(id, role, tx, WorkerHandle::Detached));
        (id, rx)
    }

    #[test]
    fn test_states_only_move_forward() {
        let mut reg = Registry::new();
        let (id, _rx) = descriptor(&mut reg, Role::Producer);
        let w = reg.get_mut(id).unwrap();

        assert!(!w.advance(ReadyState::Ready), "cannot skip started");
        assert!(w.advance(ReadyState::Started));
        assert!(!w.advance(ReadyState::Started), "no repeats");
        assert!(w.advance(ReadyState::Ready));
        assert!(w.advance(ReadyState::Running));
        assert!(!w.advance(ReadyState::Ready), "no going back");
        assert!(w.advance(ReadyState::Ended));
        assert!(!w.advance(ReadyState::Ended));
    }

    #[test]
    fn test_ended_from_any_state() {
        for state in [ReadyState::Spawned, ReadyState::Started, ReadyState::Ready] {
            assert!(state.allows(ReadyState::Ended));
        }
    }

    #[test]
    fn test_ids_are_monotonic_and_aliases_follow_role() {
        let mut reg = Registry::new();
        let (a, _ra) = descriptor(&mut reg, Role::Consumer);
        let (b, _rb) = descriptor(&mut reg, Role::Producer);
        assert_eq!((a, b), (0, 1));
        assert_eq!(reg.get(a).unwrap().alias, "sub-0");
        assert_eq!(reg.get(b).unwrap().alias, "pub-1");

        let gone = reg.deregister(a).unwrap();
        assert_eq!(gone.state(), ReadyState::Ended);
        assert_eq!(reg.live(), 1);
        assert_eq!(reg.reserve_id(), 2);
    }

    #[test]
    fn test_send_after_worker_gone_is_not_an_error() {
        let mut reg = Registry::new();
        let (id, rx) = descriptor(&mut reg, Role::Producer);
        assert!(reg.get(id).unwrap().send(ToWorker::Halt));
        drop(rx);
        assert!(!reg.get(id).unwrap().send(ToWorker::Halt));
    }
}
