//! # In-process loopback bus.
//!
//! [`MemoryBus`] routes published messages to subscribers in the same process,
//! with NSQ-like fan-out:
//!
//! ```text
//! publish(topic) ──► every channel of topic ──► one subscriber (round-robin)
//!                    no channel yet          ──► topic backlog, handed to the first channel
//!                    channel without readers ──► channel backlog, handed to the next reader
//! ```
//!
//! It also exposes hooks to exercise failure paths: refused connections,
//! rejected publishes, failed acknowledgements, redelivered units and a
//! closed broker.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{ConnectionEvent, Connector, Delivery, Payload, Publisher, Signals, Subscription};
use crate::config::WorkerConfig;
use crate::error::BusError;

const ADDR: &str = "memory";

struct Reader {
    units: mpsc::UnboundedSender<Box<dyn Delivery>>,
    faults: mpsc::UnboundedSender<BusError>,
}

/// Counters observed by a [`MemoryBus`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Messages accepted by `publish` (a batch counts each message).
    pub published: u64,
    /// Units acknowledged with `finish`.
    pub finished: u64,
    /// Lease extensions requested with `touch`.
    pub touched: u64,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    finished: AtomicU64,
    touched: AtomicU64,
    failing_finishes: AtomicU32,
}

#[derive(Default)]
struct Channel {
    readers: Vec<Reader>,
    next: usize,
    backlog: VecDeque<(Bytes, u16)>,
}

impl Channel {
    /// Hands the unit to the next live reader, or parks it.
    fn route(&mut self, body: Bytes, attempts: u16, counters: &Arc<Counters>) {
        while !self.readers.is_empty() {
            let idx = self.next % self.readers.len();
            let reader = &self.readers[idx];
            let unit = Box::new(MemoryDelivery {
                body: body.clone(),
                attempts,
                counters: Arc::clone(counters),
                faults: reader.faults.clone(),
            });
            if reader.units.send(unit).is_ok() {
                self.next = idx + 1;
                return;
            }
            // paused or closed subscription
            self.readers.swap_remove(idx);
        }
        self.backlog.push_back((body, attempts));
    }
}

#[derive(Default)]
struct Topic {
    channels: HashMap<String, Channel>,
    backlog: Vec<Bytes>,
}

#[derive(Default)]
struct Inner {
    topics: Mutex<HashMap<String, Topic>>,
    counters: Arc<Counters>,
    refuse: AtomicBool,
    reject_next: AtomicU32,
    closed: AtomicBool,
    signals: Mutex<Vec<Signals>>,
}

/// Loopback message bus. Cheap to clone; clones share all state.
#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<Inner>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> MemoryStats {
        let c = &self.inner.counters;
        MemoryStats {
            published: c.published.load(Ordering::Relaxed),
            finished: c.finished.load(Ordering::Relaxed),
            touched: c.touched.load(Ordering::Relaxed),
        }
    }

    /// Makes new publishers and subscriptions fail with [`BusError::Connect`].
    pub fn refuse_connections(&self, refuse: bool) {
        self.inner.refuse.store(refuse, Ordering::Relaxed);
    }

    /// Makes the next `n` publishes fail with [`BusError::Rejected`].
    pub fn reject_next_publishes(&self, n: u32) {
        self.inner.reject_next.store(n, Ordering::Relaxed);
    }

    /// Makes the next `n` `finish` calls fail: the unit is not acknowledged and
    /// its subscription reports [`BusError::Rejected`]`("E_FIN_FAILED")`.
    pub fn fail_next_finishes(&self, n: u32) {
        self.inner
            .counters
            .failing_finishes
            .store(n, Ordering::Relaxed);
    }

    /// Delivers `body` to every channel of `topic` as if it was attempted `attempts` times.
    pub fn redeliver(&self, topic: &str, body: impl Into<Bytes>, attempts: u16) {
        let body = body.into();
        let mut topics = self.topics();
        let topic = topics.entry(topic.to_string()).or_default();
        for channel in topic.channels.values_mut() {
            channel.route(body.clone(), attempts, &self.inner.counters);
        }
    }

    /// Shuts the broker: subscriptions end, publishes fail with [`BusError::Closed`].
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Relaxed);
        for topic in self.topics().values_mut() {
            for channel in topic.channels.values_mut() {
                channel.readers.clear();
            }
        }
        let signals = self
            .inner
            .signals
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for s in signals.iter() {
            s.publish(ConnectionEvent::Closed);
        }
    }

    fn topics(&self) -> MutexGuard<'_, HashMap<String, Topic>> {
        self.inner
            .topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn connect(&self, cfg: &WorkerConfig) -> Result<Signals, BusError> {
        if self.inner.refuse.load(Ordering::Relaxed) || self.inner.closed.load(Ordering::Relaxed) {
            return Err(BusError::Connect {
                addr: cfg.run.addr(),
                error: "connection refused".to_string(),
            });
        }
        let signals = Signals::default();
        signals.publish(ConnectionEvent::Connected {
            addr: ADDR.to_string(),
        });
        self.inner
            .signals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(signals.clone());
        Ok(signals)
    }

    fn publish_now(&self, topic: &str, payload: &Payload) -> Result<(), BusError> {
        if self.inner.closed.load(Ordering::Relaxed) {
            return Err(BusError::Closed);
        }
        let rejected = self
            .inner
            .reject_next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(BusError::Rejected("E_PUB_FAILED".to_string()));
        }

        let mut topics = self.topics();
        let topic = topics.entry(topic.to_string()).or_default();
        for body in payload.messages() {
            if topic.channels.is_empty() {
                topic.backlog.push(body.clone());
            }
            for channel in topic.channels.values_mut() {
                channel.route(body.clone(), 1, &self.inner.counters);
            }
        }
        self.inner
            .counters
            .published
            .fetch_add(payload.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}

#[async_trait]
impl Connector for MemoryBus {
    async fn publisher(&self, cfg: &WorkerConfig) -> Result<Arc<dyn Publisher>, BusError> {
        let signals = self.connect(cfg)?;
        Ok(Arc::new(MemoryPublisher {
            bus: self.clone(),
            signals,
        }))
    }

    async fn subscribe(&self, cfg: &WorkerConfig) -> Result<Subscription, BusError> {
        let signals = self.connect(cfg)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let (faults_tx, faults_rx) = mpsc::unbounded_channel();

        let mut topics = self.topics();
        let topic = topics.entry(cfg.run.topic.clone()).or_default();
        let parked = std::mem::take(&mut topic.backlog);
        let channel = topic.channels.entry(cfg.run.channel.clone()).or_default();
        channel.readers.push(Reader {
            units: tx,
            faults: faults_tx,
        });
        let waiting: Vec<_> = channel
            .backlog
            .drain(..)
            .chain(parked.into_iter().map(|body| (body, 1)))
            .collect();
        for (body, attempts) in waiting {
            channel.route(body, attempts, &self.inner.counters);
        }

        Ok(Subscription::new(rx, signals, CancellationToken::new()).with_faults(faults_rx))
    }
}

struct MemoryPublisher {
    bus: MemoryBus,
    signals: Signals,
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(&self, topic: &str, payload: &Payload) -> Result<(), BusError> {
        self.bus.publish_now(topic, payload)
    }

    fn signals(&self) -> &Signals {
        &self.signals
    }
}

struct MemoryDelivery {
    body: Bytes,
    attempts: u16,
    counters: Arc<Counters>,
    faults: mpsc::UnboundedSender<BusError>,
}

impl Delivery for MemoryDelivery {
    fn attempts(&self) -> u16 {
        self.attempts
    }

    fn body(&self) -> &[u8] {
        &self.body
    }

    fn touch(&self) {
        self.counters.touched.fetch_add(1, Ordering::Relaxed);
    }

    fn finish(self: Box<Self>) {
        let failed = self
            .counters
            .failing_finishes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            let _ = self
                .faults
                .send(BusError::Rejected("E_FIN_FAILED".to_string()));
            return;
        }
        self.counters.finished.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Received;
    use crate::config::{Role, RunConfig};

    fn cfg(role: Role, channel: &str) -> WorkerConfig {
        RunConfig {
            topic: "bench".into(),
            channel: channel.into(),
            ..RunConfig::default()
        }
        .worker(0, role)
    }

    #[tokio::test]
    async fn test_round_robin_within_a_channel_and_fan_out_across_channels() {
        let bus = MemoryBus::new();
        let mut a = bus.subscribe(&cfg(Role::Consumer, "c1")).await.unwrap();
        let mut b = bus.subscribe(&cfg(Role::Consumer, "c1")).await.unwrap();
        let mut other = bus.subscribe(&cfg(Role::Consumer, "c2")).await.unwrap();

        let publisher = bus.publisher(&cfg(Role::Producer, "c1")).await.unwrap();
        publisher
            .publish("bench", &Payload::build(4, 4))
            .await
            .unwrap();

        let count = |sub: &mut Subscription| {
            let mut n = 0;
            while let Some(unit) = sub.try_next() {
                unit.finish();
                n += 1;
            }
            n
        };
        assert_eq!(count(&mut a), 2);
        assert_eq!(count(&mut b), 2);
        assert_eq!(count(&mut other), 4);
        assert_eq!(
            bus.stats(),
            MemoryStats {
                published: 4,
                finished: 8,
                touched: 0
            }
        );
    }

    #[tokio::test]
    async fn test_messages_published_before_subscribe_are_kept() {
        let bus = MemoryBus::new();
        let publisher = bus.publisher(&cfg(Role::Producer, "c")).await.unwrap();
        publisher
            .publish("bench", &Payload::build(4, 1))
            .await
            .unwrap();

        let mut sub = bus.subscribe(&cfg(Role::Consumer, "c")).await.unwrap();
        let unit = sub.try_next().unwrap();
        assert_eq!(unit.attempts(), 1);
        assert_eq!(unit.body(), b"zzzz");
    }

    #[tokio::test]
    async fn test_closed_reader_is_skipped() {
        let bus = MemoryBus::new();
        let mut gone = bus.subscribe(&cfg(Role::Consumer, "c")).await.unwrap();
        let mut live = bus.subscribe(&cfg(Role::Consumer, "c")).await.unwrap();
        gone.close().await;

        bus.redeliver("bench", "x", 3);
        bus.redeliver("bench", "y", 3);
        assert_eq!(live.try_next().unwrap().attempts(), 3);
        assert!(live.try_next().is_some());
    }

    #[tokio::test]
    async fn test_failure_hooks() {
        let bus = MemoryBus::new();
        let publisher = bus.publisher(&cfg(Role::Producer, "c")).await.unwrap();

        bus.reject_next_publishes(1);
        let payload = Payload::build(1, 1);
        assert!(matches!(
            publisher.publish("bench", &payload).await,
            Err(BusError::Rejected(_))
        ));
        assert!(publisher.publish("bench", &payload).await.is_ok());

        bus.refuse_connections(true);
        let err = bus.subscribe(&cfg(Role::Consumer, "c")).await.err().unwrap();
        assert_eq!(err.as_label(), "bus_connect");
        bus.refuse_connections(false);

        let mut sub = bus.subscribe(&cfg(Role::Consumer, "c")).await.unwrap();
        let mut events = sub.events();
        bus.close();
        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Closed);
        assert!(sub.next().await.is_none());
        assert!(matches!(
            publisher.publish("bench", &payload).await,
            Err(BusError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_paused_subscription_keeps_its_buffer_and_loses_nothing_new() {
        let bus = MemoryBus::new();
        let mut paused = bus.subscribe(&cfg(Role::Consumer, "c")).await.unwrap();
        bus.redeliver("bench", "before", 1);
        paused.pause();

        let mut other = bus.subscribe(&cfg(Role::Consumer, "c")).await.unwrap();
        bus.redeliver("bench", "after-1", 1);
        bus.redeliver("bench", "after-2", 1);

        assert_eq!(paused.try_next().unwrap().body(), b"before");
        assert!(paused.try_next().is_none());
        assert_eq!(other.try_next().unwrap().body(), b"after-1");
        assert_eq!(other.try_next().unwrap().body(), b"after-2");
    }

    #[tokio::test]
    async fn test_failed_finish_is_reported_on_the_subscription() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe(&cfg(Role::Consumer, "c")).await.unwrap();
        bus.fail_next_finishes(1);
        bus.redeliver("bench", "a", 1);
        bus.redeliver("bench", "b", 1);

        let Received::Unit(first) = sub.next_event().await else {
            panic!("expected a unit");
        };
        first.finish();
        match sub.next_event().await {
            Received::Fault(BusError::Rejected(reason)) => assert_eq!(reason, "E_FIN_FAILED"),
            _ => panic!("expected the fault before the next unit"),
        }
        let Received::Unit(second) = sub.next_event().await else {
            panic!("expected a unit");
        };
        second.finish();
        assert_eq!(bus.stats().finished, 1);
    }
}
