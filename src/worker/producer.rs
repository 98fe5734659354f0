//! Producer role: publish the fixed payload as fast as the bus accepts it.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use super::report::Reporter;
use super::{Control, Link};
use crate::bus::{Connector, Payload, Publisher};
use crate::config::{ErrorPolicy, WorkerConfig};
use crate::error::{BusError, WorkerError};

pub(crate) struct Producer {
    publisher: Arc<dyn Publisher>,
    topic: String,
    payload: Payload,
    on_error: ErrorPolicy,
}

impl Producer {
    pub async fn setup(connector: &dyn Connector, cfg: &WorkerConfig) -> Result<Self, BusError> {
        let publisher = connector.publisher(cfg).await?;
        super::watch_connection(&cfg.alias, publisher.signals().subscribe());
        Ok(Self {
            publisher,
            topic: cfg.run.topic.clone(),
            payload: Payload::build(cfg.run.message_size, cfg.run.batch_size),
            on_error: cfg.run.on_error,
        })
    }

    /// Publishes until halted or the bus gives up.
    ///
    /// A halt never interrupts a publish in flight: the loop waits for its
    /// outcome, counts it, then stops.
    pub async fn drive<R, W>(
        &mut self,
        link: &mut Link<R, W>,
        reporter: &mut Reporter,
    ) -> Result<(), WorkerError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let batch = self.payload.len() as u64;
        let mut halted = false;

        loop {
            let mut publish = self.publisher.publish(&self.topic, &self.payload);
            let outcome = loop {
                tokio::select! {
                    res = &mut publish => break res,
                    _ = reporter.due() => reporter.flush_due(&mut link.outbox).await?,
                    msg = link.inbox.next(), if !halted => {
                        if let Control::Halt = super::control(msg) {
                            debug!("halt received; finishing publish in flight");
                            halted = true;
                        }
                    }
                }
            };

            match outcome {
                Ok(()) => reporter.sent(batch),
                Err(BusError::Closed) => return Err(WorkerError::ConnectionLost),
                Err(e) => match self.on_error {
                    ErrorPolicy::Swallow => {
                        warn!(label = e.as_label(), error = %e, "publish failed");
                    }
                    ErrorPolicy::Halt => return Err(WorkerError::Bus(e)),
                },
            }
            if halted {
                return Ok(());
            }
            reporter.flush_due(&mut link.outbox).await?;
            tokio::task::yield_now().await;
        }
    }
}
