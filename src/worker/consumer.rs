//! Consumer role: count deliveries, finish them now or through [`DeferredAcks`].

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use super::report::Reporter;
use super::{Control, Link};
use crate::ack::DeferredAcks;
use crate::bus::{Connector, Delivery, Received, Subscription};
use crate::config::{ErrorPolicy, WorkerConfig};
use crate::error::{BusError, WorkerError};

pub(crate) struct Consumer {
    subscription: Subscription,
    acks: DeferredAcks,
    ack_delay: Option<Duration>,
    remind_interval: Option<Duration>,
    on_error: ErrorPolicy,
}

impl Consumer {
    pub async fn setup(connector: &dyn Connector, cfg: &WorkerConfig) -> Result<Self, BusError> {
        let subscription = connector.subscribe(cfg).await?;
        super::watch_connection(&cfg.alias, subscription.events());
        Ok(Self {
            subscription,
            acks: DeferredAcks::new(),
            ack_delay: cfg.run.ack_delay(),
            remind_interval: cfg.run.remind_interval(),
            on_error: cfg.run.on_error,
        })
    }

    /// Consumes until halted or the subscription ends.
    pub async fn drive<R, W>(
        &mut self,
        link: &mut Link<R, W>,
        reporter: &mut Reporter,
    ) -> Result<(), WorkerError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        loop {
            tokio::select! {
                event = self.subscription.next_event() => match event {
                    Received::Unit(unit) => self.accept(unit, reporter),
                    Received::Fault(e) => match self.on_error {
                        ErrorPolicy::Swallow => {
                            warn!(label = e.as_label(), error = %e, "delivery operation failed");
                        }
                        ErrorPolicy::Halt => return Err(WorkerError::Bus(e)),
                    },
                    Received::Ended => return Err(WorkerError::ConnectionLost),
                },
                fired = self.acks.next_fired() => debug!(?fired, "deferred ack timer"),
                _ = reporter.due() => reporter.flush_due(&mut link.outbox).await?,
                msg = link.inbox.next() => {
                    if let Control::Halt = super::control(msg) {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Stops intake, finishes everything delivered so far, then leaves the
    /// subscription.
    pub async fn drain(&mut self, reporter: &mut Reporter) {
        self.subscription.pause();
        let mut buffered = 0usize;
        while let Some(unit) = self.subscription.try_next() {
            reporter.received(unit.attempts() > 1);
            unit.finish();
            buffered += 1;
        }
        let held = self.acks.finalize_all();
        self.subscription.close().await;
        info!(held, buffered, "consumer drained");
    }

    fn accept(&mut self, unit: Box<dyn Delivery>, reporter: &mut Reporter) {
        reporter.received(unit.attempts() > 1);
        self.acks.hold(unit, self.ack_delay, self.remind_interval);
    }
}
