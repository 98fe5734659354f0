//! Worker-side report accumulation: a [`ReportSample`] plus the [`Throttle`] pacing it.

use std::time::Duration;

use tokio::io::AsyncWrite;
use tokio::time::Instant;

use crate::config::Role;
use crate::error::ProtocolError;
use crate::protocol::{EnvelopeSink, ReportSample, ToSupervisor};
use crate::throttle::Throttle;

pub(crate) struct Reporter {
    sample: ReportSample,
    throttle: Throttle,
}

impl Reporter {
    pub fn new(role: Role, (min, max): (Duration, Duration)) -> Self {
        Self {
            sample: ReportSample::zero(role),
            throttle: Throttle::new(min, max),
        }
    }

    /// Counts `n` published messages.
    pub fn sent(&mut self, n: u64) {
        if let ReportSample::Producer { sent } = &mut self.sample {
            *sent += n;
        }
        self.throttle.notify(Instant::now());
    }

    /// Counts one delivered unit; `retried` when the broker delivered it before.
    pub fn received(&mut self, retried: bool) {
        if let ReportSample::Consumer {
            received,
            retried: retries,
        } = &mut self.sample
        {
            *received += 1;
            if retried {
                *retries += 1;
            }
        }
        self.throttle.notify(Instant::now());
    }

    pub async fn due(&self) {
        self.throttle.due().await
    }

    /// Sends the accumulated sample if the throttle allows it.
    pub async fn flush_due<W>(
        &mut self,
        outbox: &mut EnvelopeSink<W, ToSupervisor>,
    ) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        if self.throttle.try_flush(Instant::now()) {
            outbox.send(&ToSupervisor::Report(self.sample.take())).await?;
        }
        Ok(())
    }

    /// Sends whatever is accumulated, zero included.
    pub async fn flush_final<W>(
        &mut self,
        outbox: &mut EnvelopeSink<W, ToSupervisor>,
    ) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        self.throttle.force_flush(Instant::now());
        outbox.send(&ToSupervisor::Report(self.sample.take())).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{EnvelopeStream, Incoming};

    #[tokio::test]
    async fn test_final_flush_sends_zero_sample() {
        let (a, b) = tokio::io::duplex(1024);
        let mut outbox = EnvelopeSink::new(a);
        let mut inbox = EnvelopeStream::<_, ToSupervisor>::new(b);

        let mut reporter = Reporter::new(
            Role::Consumer,
            (Duration::from_millis(250), Duration::from_millis(1_000)),
        );
        reporter.flush_final(&mut outbox).await.unwrap();

        assert_eq!(
            inbox.next().await.unwrap().unwrap(),
            Incoming::Known(ToSupervisor::Report(ReportSample::zero(Role::Consumer)))
        );
    }

    #[tokio::test]
    async fn test_counts_reset_after_each_flush() {
        let (a, b) = tokio::io::duplex(1024);
        let mut outbox = EnvelopeSink::new(a);
        let mut inbox = EnvelopeStream::<_, ToSupervisor>::new(b);

        let mut reporter =
            Reporter::new(Role::Consumer, (Duration::from_secs(60), Duration::from_secs(60)));
        reporter.received(false);
        reporter.received(true);
        // first notification is due at once
        reporter.flush_due(&mut outbox).await.unwrap();
        reporter.received(true);
        // the next one waits for min delay
        reporter.flush_due(&mut outbox).await.unwrap();
        reporter.flush_final(&mut outbox).await.unwrap();

        let mut samples = Vec::new();
        for _ in 0..2 {
            match inbox.next().await.unwrap().unwrap() {
                Incoming::Known(ToSupervisor::Report(s)) => samples.push(s),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(
            samples,
            vec![
                ReportSample::Consumer {
                    received: 2,
                    retried: 1
                },
                ReportSample::Consumer {
                    received: 1,
                    retried: 1
                },
            ]
        );
    }
}
