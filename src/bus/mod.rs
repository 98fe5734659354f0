//! # Message-bus collaborator surface.
//!
//! Workers never speak a wire protocol directly; they go through the small
//! capability set defined here:
//!
//! - [`Publisher::publish`]: send one [`Payload`] (single message or batch) to a topic
//! - [`Connector::subscribe`]: obtain a [`Subscription`] yielding [`Delivery`] units
//!   that expose `attempts()`, `finish()` and `touch()`
//! - [`ConnectionEvent`]: connected / disconnected / reconnecting / closed, observable
//!   through [`Signals`]
//!
//! ## Backends ([`Library`])
//! ```text
//! Library::Nsq  ──► nsq::NsqPublisher / nsq::subscribe   (TCP, protocol V2)
//! Library::Null ──► null::NullPublisher / null::subscribe (no I/O)
//! MemoryBus     ──► in-process loopback (tests, embedding)
//! ```
//! [`LibraryConnector`] picks the backend per role from the run configuration.

mod memory;
mod nsq;
mod null;
mod signals;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::{Library, Role, WorkerConfig};
use crate::error::BusError;

pub use memory::{MemoryBus, MemoryStats};
pub use signals::Signals;
#[cfg(test)]
pub(crate) use nsq::fake_broker;

/// How long [`Subscription::close`] waits for its connection task to leave.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Connection lifecycle, surfaced for observation only.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected { addr: String },
    Disconnected { reason: String },
    Reconnecting { attempt: u32, delay: Duration },
    /// Reconnection gave up or the connection was closed on purpose.
    Closed,
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionEvent::Connected { addr } => write!(f, "connected to {addr}"),
            ConnectionEvent::Disconnected { reason } => write!(f, "disconnected: {reason}"),
            ConnectionEvent::Reconnecting { attempt, delay } => {
                write!(f, "reconnecting (attempt {attempt}) in {delay:?}")
            }
            ConnectionEvent::Closed => f.write_str("closed"),
        }
    }
}

/// What a producer publishes on every loop turn.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    /// One message (`PUB`).
    Single(Bytes),
    /// Several messages in one round trip (`MPUB`).
    Batch(Vec<Bytes>),
}

impl Payload {
    /// Builds the fixed payload of a run: `batch_size` messages of `message_size` bytes.
    pub fn build(message_size: usize, batch_size: usize) -> Self {
        let message = Bytes::from(vec![b'z'; message_size]);
        if batch_size > 1 {
            Payload::Batch(vec![message; batch_size])
        } else {
            Payload::Single(message)
        }
    }

    /// Number of messages carried.
    pub fn len(&self) -> usize {
        match self {
            Payload::Single(_) => 1,
            Payload::Batch(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates over the message bodies.
    pub fn messages(&self) -> impl Iterator<Item = &Bytes> {
        let items: &[Bytes] = match self {
            Payload::Single(one) => std::slice::from_ref(one),
            Payload::Batch(items) => items,
        };
        items.iter()
    }
}

/// Publishing half of a bus client.
#[async_trait]
pub trait Publisher: Send + Sync + 'static {
    /// Publishes `payload` to `topic`; resolves once the broker accepted it.
    async fn publish(&self, topic: &str, payload: &Payload) -> Result<(), BusError>;

    /// Connection lifecycle signals of this publisher.
    fn signals(&self) -> &Signals;
}

/// One delivered message, not yet finalized.
pub trait Delivery: Send + 'static {
    /// How many times the broker has delivered this message (1 on first delivery).
    fn attempts(&self) -> u16;

    fn body(&self) -> &[u8];

    /// Extends the lease without acknowledging ("still working on it").
    fn touch(&self);

    /// Acknowledges the message. Consumes the unit.
    fn finish(self: Box<Self>);
}

/// What a subscription produced next.
pub enum Received {
    /// A delivered unit, to be finished or touched.
    Unit(Box<dyn Delivery>),
    /// The broker refused an operation on a delivered unit (e.g. `E_FIN_FAILED`).
    Fault(BusError),
    /// The connection is gone for good.
    Ended,
}

impl fmt::Debug for Received {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Received::Unit(unit) => f
                .debug_struct("Unit")
                .field("attempts", &unit.attempts())
                .field("len", &unit.body().len())
                .finish(),
            Received::Fault(e) => f.debug_tuple("Fault").field(e).finish(),
            Received::Ended => f.write_str("Ended"),
        }
    }
}

/// An active subscription: a stream of deliveries plus its connection signals.
///
/// ## Shutdown
/// ```text
/// pause()  ──► no new units are accepted (NSQ: RDY 0); buffered units stay readable
/// try_next ──► drain what was buffered
/// close()  ──► pending FIN/TOUCH flushed, connection closed (NSQ: CLS)
/// ```
pub struct Subscription {
    deliveries: mpsc::UnboundedReceiver<Box<dyn Delivery>>,
    faults: Option<mpsc::UnboundedReceiver<BusError>>,
    signals: Signals,
    intake: CancellationToken,
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
    _idle: Option<mpsc::UnboundedSender<Box<dyn Delivery>>>,
}

impl Subscription {
    pub(crate) fn new(
        deliveries: mpsc::UnboundedReceiver<Box<dyn Delivery>>,
        signals: Signals,
        stop: CancellationToken,
    ) -> Self {
        Self {
            deliveries,
            faults: None,
            signals,
            intake: CancellationToken::new(),
            stop,
            task: None,
            _idle: None,
        }
    }

    /// Attaches the connection task that feeds this subscription.
    pub(crate) fn with_task(mut self, task: JoinHandle<()>) -> Self {
        self.task = Some(task);
        self
    }

    /// Attaches the channel carrying broker errors about delivered units.
    pub(crate) fn with_faults(mut self, faults: mpsc::UnboundedReceiver<BusError>) -> Self {
        self.faults = Some(faults);
        self
    }

    /// Token cancelled by [`Subscription::pause`].
    pub(crate) fn with_intake(mut self, intake: CancellationToken) -> Self {
        self.intake = intake;
        self
    }

    /// A subscription that stays open and never delivers.
    pub(crate) fn idle(signals: Signals) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut sub = Self::new(rx, signals, CancellationToken::new());
        sub._idle = Some(tx);
        sub
    }

    /// Next delivered unit; `None` once the connection is gone for good.
    ///
    /// Cancel-safe.
    pub async fn next(&mut self) -> Option<Box<dyn Delivery>> {
        self.deliveries.recv().await
    }

    /// Next unit or broker fault; faults already reported come first.
    ///
    /// Cancel-safe.
    pub async fn next_event(&mut self) -> Received {
        tokio::select! {
            biased;
            fault = next_fault(&mut self.faults) => Received::Fault(fault),
            unit = self.deliveries.recv() => match unit {
                Some(unit) => Received::Unit(unit),
                None => Received::Ended,
            },
        }
    }

    /// Next unit already buffered, without waiting.
    pub fn try_next(&mut self) -> Option<Box<dyn Delivery>> {
        self.deliveries.try_recv().ok()
    }

    /// New receiver for this subscription's connection events.
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.signals.subscribe()
    }

    /// Stops accepting new units. Units already buffered can still be drained
    /// with [`Subscription::try_next`] and acknowledged.
    pub fn pause(&mut self) {
        self.intake.cancel();
        self.deliveries.close();
        self._idle = None;
    }

    /// Stops accepting deliveries and waits for the connection to wind down.
    ///
    /// Units already handed out stay valid; acknowledgements issued before this
    /// call are flushed to the broker first.
    pub async fn close(&mut self) {
        self.pause();
        self.stop.cancel();
        if let Some(task) = self.task.take() {
            if tokio::time::timeout(CLOSE_GRACE, task).await.is_err() {
                warn!(grace = ?CLOSE_GRACE, "subscription connection did not close in time");
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Pends forever when there is no fault channel or it closed.
async fn next_fault(faults: &mut Option<mpsc::UnboundedReceiver<BusError>>) -> BusError {
    match faults {
        Some(rx) => match rx.recv().await {
            Some(fault) => fault,
            None => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}

/// Opens bus clients for a worker.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Connects a publisher; failure is a setup failure.
    async fn publisher(&self, cfg: &WorkerConfig) -> Result<Arc<dyn Publisher>, BusError>;

    /// Connects and subscribes to `cfg.topic` / `cfg.channel`; failure is a setup failure.
    async fn subscribe(&self, cfg: &WorkerConfig) -> Result<Subscription, BusError>;
}

/// Connector that honours `lib` / `pub_lib` / `sub_lib` from the run configuration.
#[derive(Clone, Copy, Debug, Default)]
pub struct LibraryConnector;

#[async_trait]
impl Connector for LibraryConnector {
    async fn publisher(&self, cfg: &WorkerConfig) -> Result<Arc<dyn Publisher>, BusError> {
        match cfg.run.library_for(Role::Producer) {
            Library::Nsq => Ok(Arc::new(nsq::NsqPublisher::connect(cfg).await?)),
            Library::Null => Ok(Arc::new(null::NullPublisher::default())),
        }
    }

    async fn subscribe(&self, cfg: &WorkerConfig) -> Result<Subscription, BusError> {
        match cfg.run.library_for(Role::Consumer) {
            Library::Nsq => nsq::subscribe(cfg).await,
            Library::Null => Ok(null::subscribe()),
        }
    }
}
