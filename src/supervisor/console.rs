//! # Console rendering.
//!
//! The supervisor is the only component that renders user-visible status. It
//! does so through a [`StatusSink`]; [`Console`] prints to stdout:
//!
//! ```text
//! [wd40] nsq://localhost:4150 topic=bench#ephemeral channel=wd40#ephemeral
//! [wd40] producers=1 (nsq) consumers=1 (nsq) qos=1 message-size=64 batch-size=1 report=1000..5000ms
//! [report] sent=120000 received=119870 retried=0 offset=130 elapsed=2.0s rate=60000/s
//! [done] sent=300000 received=300000 retried=0 offset=0 elapsed=5.0s failed=0
//! ```

use std::time::Duration;

use crate::config::{Role, RunConfig};
use crate::protocol::ReportSample;

/// Running totals merged from every worker report.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GlobalCounters {
    pub sent: u64,
    pub received: u64,
    pub retried: u64,
}

impl GlobalCounters {
    pub fn merge(&mut self, sample: ReportSample) {
        match sample {
            ReportSample::Producer { sent } => self.sent += sent,
            ReportSample::Consumer { received, retried } => {
                self.received += received;
                self.retried += retried;
            }
        }
    }

    /// Messages published but not (yet) received.
    pub fn offset(&self) -> i128 {
        i128::from(self.sent) - i128::from(self.received)
    }
}

/// A worker that ended with a reason.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FailedWorker {
    pub alias: String,
    pub reason: String,
}

/// Outcome of a completed run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunSummary {
    pub sent: u64,
    pub received: u64,
    pub retried: u64,
    pub elapsed: Duration,
    pub failed_workers: Vec<FailedWorker>,
}

impl RunSummary {
    /// Whether every worker ended without a reason.
    pub fn is_success(&self) -> bool {
        self.failed_workers.is_empty()
    }

    pub fn counters(&self) -> GlobalCounters {
        GlobalCounters {
            sent: self.sent,
            received: self.received,
            retried: self.retried,
        }
    }
}

/// Destination of the supervisor's user-visible output.
pub trait StatusSink: Send {
    /// Once, before any worker is launched.
    fn banner(&mut self, cfg: &RunConfig);

    /// Throttled progress line.
    fn progress(&mut self, counters: &GlobalCounters, elapsed: Duration);

    /// Once, after the last worker ended.
    fn finished(&mut self, summary: &RunSummary);
}

/// Prints status lines to stdout.
#[derive(Clone, Copy, Debug, Default)]
pub struct Console;

impl Console {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

fn rate(count: u64, elapsed: Duration) -> u64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        (count as f64 / secs) as u64
    } else {
        0
    }
}

impl StatusSink for Console {
    fn banner(&mut self, cfg: &RunConfig) {
        println!(
            "[wd40] {}://{} topic={} channel={}",
            cfg.lib,
            cfg.addr(),
            cfg.topic,
            cfg.channel
        );
        println!(
            "[wd40] producers={} ({}) consumers={} ({}) qos={} message-size={} batch-size={} report={}..{}ms",
            cfg.publisher_count,
            cfg.library_for(Role::Producer),
            cfg.subscriber_count,
            cfg.library_for(Role::Consumer),
            cfg.qos,
            cfg.message_size,
            cfg.batch_size,
            cfg.min_report_delay_ms,
            cfg.max_report_delay_ms,
        );
        if let Some(delay) = cfg.ack_delay() {
            println!(
                "[wd40] ack-delay={delay:?} remind-interval={:?}",
                cfg.remind_interval()
            );
        }
    }

    fn progress(&mut self, c: &GlobalCounters, elapsed: Duration) {
        println!(
            "[report] sent={} received={} retried={} offset={} elapsed={:.1}s rate={}/s",
            c.sent,
            c.received,
            c.retried,
            c.offset(),
            elapsed.as_secs_f64(),
            rate(c.received.max(c.sent), elapsed),
        );
    }

    fn finished(&mut self, s: &RunSummary) {
        let c = s.counters();
        println!(
            "[done] sent={} received={} retried={} offset={} elapsed={:.1}s failed={}",
            c.sent,
            c.received,
            c.retried,
            c.offset(),
            s.elapsed.as_secs_f64(),
            s.failed_workers.len(),
        );
        for failed in &s.failed_workers {
            println!("[failed] worker={} reason={:?}", failed.alias, failed.reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_is_role_aware() {
        let mut c = GlobalCounters::default();
        c.merge(ReportSample::Producer { sent: 10 });
        c.merge(ReportSample::Consumer {
            received: 7,
            retried: 2,
        });
        c.merge(ReportSample::Producer { sent: 5 });
        assert_eq!(
            c,
            GlobalCounters {
                sent: 15,
                received: 7,
                retried: 2
            }
        );
        assert_eq!(c.offset(), 8);
    }

    #[test]
    fn test_rate_handles_zero_elapsed() {
        assert_eq!(rate(100, Duration::ZERO), 0);
        assert_eq!(rate(100, Duration::from_secs(4)), 25);
    }
}
