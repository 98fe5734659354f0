//! # Worker runtime.
//!
//! A worker hosts one [`Role`] and talks to its supervisor over an envelope
//! channel (its own stdin/stdout when launched as a process).
//!
//! ## Lifecycle
//! ```text
//! INIT ──started──► AWAIT_CONFIG ──config──► SETUP ──ready──► WAIT_RUN ──run──► RUNNING
//!                        │                     │                 │                │
//!                      halt                 failure            halt        halt / EOF / bus closed
//!                        ▼                     ▼                 ▼                ▼
//!                   TERMINATED ◄─── error + ended(reason) ◄──────┘            HALTING
//!                                                                    final report + ended
//!                                                                                 ▼
//!                                                                            TERMINATED
//! ```
//!
//! ## Rules
//! - `ended` is always the last envelope; a reason means exit status 1.
//! - A halt before `run` aborts: there is no traffic loop to drain yet.
//! - While running, the control channel closing counts as a halt.
//! - Halting lets the bus operation in flight finish, then force-flushes the
//!   report exactly once before `ended`.
//! - A broker error on a finish or touch follows the error policy, like a failed
//!   publish: logged under `swallow`, fatal under `halt`.
//! - Halting pauses consumer intake before draining what is already buffered.
//! - Duplicate `run`/`config`/`halt` envelopes and unknown tags are logged and ignored.

mod consumer;
mod producer;
mod report;

use std::fmt;
use std::process::ExitCode;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::bus::{ConnectionEvent, Connector};
use crate::config::{Role, WorkerConfig};
use crate::error::{ConfigError, ProtocolError, WorkerError};
use crate::protocol::{
    Envelope, EnvelopeSink, EnvelopeStream, Failure, Incoming, ToSupervisor, ToWorker,
};

use consumer::Consumer;
use producer::Producer;
use report::Reporter;

/// Position of a worker in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum WorkerState {
    Init,
    AwaitConfig,
    Setup,
    WaitRun,
    Running,
    Halting,
    Terminated,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Init => "init",
            WorkerState::AwaitConfig => "await_config",
            WorkerState::Setup => "setup",
            WorkerState::WaitRun => "wait_run",
            WorkerState::Running => "running",
            WorkerState::Halting => "halting",
            WorkerState::Terminated => "terminated",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Both halves of the control channel.
pub(crate) struct Link<R, W> {
    pub inbox: EnvelopeStream<R, ToWorker>,
    pub outbox: EnvelopeSink<W, ToSupervisor>,
}

pub(crate) enum Control {
    Continue,
    Halt,
}

/// Interprets a control-channel read while running.
pub(crate) fn control(msg: Option<Result<Incoming<ToWorker>, ProtocolError>>) -> Control {
    match msg {
        None => {
            info!("control channel closed; halting");
            Control::Halt
        }
        Some(Ok(Incoming::Known(ToWorker::Halt))) => Control::Halt,
        Some(Ok(Incoming::Known(other))) => {
            debug!(channel = other.tag(), "ignoring envelope while running");
            Control::Continue
        }
        Some(Ok(Incoming::Unknown { channel, .. })) => {
            warn!(%channel, "unknown envelope ignored");
            Control::Continue
        }
        Some(Err(ProtocolError::Io(e))) => {
            warn!(error = %e, "control channel failed; halting");
            Control::Halt
        }
        Some(Err(e)) => {
            warn!(label = e.as_label(), error = %e, "bad envelope ignored");
            Control::Continue
        }
    }
}

/// Logs a bus client's connection events until the client goes away.
pub(crate) fn watch_connection(alias: &str, mut events: broadcast::Receiver<ConnectionEvent>) {
    let span = info_span!("bus", worker = %alias);
    tokio::spawn(
        async move {
            loop {
                match events.recv().await {
                    Ok(ConnectionEvent::Disconnected { reason }) => {
                        warn!(%reason, "bus disconnected")
                    }
                    Ok(ev) => info!(event = %ev, "bus connection"),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(skipped = n, "connection events lagged")
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
        .instrument(span),
    );
}

enum RoleLoop {
    Producer(Producer),
    Consumer(Consumer),
}

/// Drives one worker through its lifecycle over a control channel.
pub struct WorkerRuntime<R, W> {
    role: Role,
    link: Link<R, W>,
    connector: Arc<dyn Connector>,
    state: WorkerState,
}

impl<R, W> WorkerRuntime<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(role: Role, reader: R, writer: W, connector: Arc<dyn Connector>) -> Self {
        Self {
            role,
            link: Link {
                inbox: EnvelopeStream::new(reader),
                outbox: EnvelopeSink::new(writer),
            },
            connector,
            state: WorkerState::Init,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Runs the whole lifecycle and announces `ended`.
    pub async fn run(mut self) -> Result<(), WorkerError> {
        let outcome = self.lifecycle().await;

        let reason = match &outcome {
            Ok(()) => None,
            Err(e) => {
                error!(label = e.as_label(), error = %e, state = %self.state, "worker failed");
                let failure = Failure {
                    label: e.as_label().to_string(),
                    message: e.to_string(),
                };
                if let Err(send_err) = self.link.outbox.send(&ToSupervisor::Error(failure)).await {
                    debug!(error = %send_err, "could not report failure");
                }
                Some(e.to_string())
            }
        };
        if let Err(e) = self.link.outbox.send(&ToSupervisor::Ended(reason)).await {
            warn!(error = %e, "could not announce end");
        }
        self.enter(WorkerState::Terminated);
        outcome
    }

    async fn lifecycle(&mut self) -> Result<(), WorkerError> {
        self.link.outbox.send(&ToSupervisor::Started).await?;
        self.enter(WorkerState::AwaitConfig);

        let cfg = self.await_config().await?;
        if cfg.role != self.role {
            return Err(ConfigError::invalid(
                "role",
                format!("configured as {} but launched as {}", cfg.role, self.role),
            )
            .into());
        }
        cfg.run.validate()?;

        let span = info_span!("worker", worker = %cfg.alias);
        self.configured(cfg).instrument(span).await
    }

    async fn configured(&mut self, cfg: WorkerConfig) -> Result<(), WorkerError> {
        self.enter(WorkerState::Setup);
        let connector = Arc::clone(&self.connector);
        let mut role = match self.role {
            Role::Producer => Producer::setup(connector.as_ref(), &cfg)
                .await
                .map(RoleLoop::Producer),
            Role::Consumer => Consumer::setup(connector.as_ref(), &cfg)
                .await
                .map(RoleLoop::Consumer),
        }
        .map_err(WorkerError::Setup)?;

        self.link.outbox.send(&ToSupervisor::Ready).await?;
        self.enter(WorkerState::WaitRun);
        self.await_run().await?;

        self.enter(WorkerState::Running);
        let mut reporter = Reporter::new(self.role, cfg.run.worker_report_bounds());
        let stopped = match &mut role {
            RoleLoop::Producer(p) => p.drive(&mut self.link, &mut reporter).await,
            RoleLoop::Consumer(c) => c.drive(&mut self.link, &mut reporter).await,
        };

        self.enter(WorkerState::Halting);
        if let RoleLoop::Consumer(c) = &mut role {
            c.drain(&mut reporter).await;
        }
        reporter.flush_final(&mut self.link.outbox).await?;
        stopped
    }

    async fn await_config(&mut self) -> Result<WorkerConfig, WorkerError> {
        loop {
            match self.link.inbox.next().await {
                None => return Err(ProtocolError::Closed { expected: "config" }.into()),
                Some(Ok(Incoming::Known(ToWorker::Config(cfg)))) => return Ok(*cfg),
                Some(Ok(Incoming::Known(ToWorker::Halt))) => {
                    return Err(WorkerError::HaltedBeforeRun);
                }
                Some(other) => self.ignore(other),
            }
        }
    }

    async fn await_run(&mut self) -> Result<(), WorkerError> {
        loop {
            match self.link.inbox.next().await {
                Some(Ok(Incoming::Known(ToWorker::Run))) => return Ok(()),
                None | Some(Ok(Incoming::Known(ToWorker::Halt))) => {
                    return Err(WorkerError::HaltedBeforeRun);
                }
                Some(other) => self.ignore(other),
            }
        }
    }

    fn ignore(&self, msg: Result<Incoming<ToWorker>, ProtocolError>) {
        match msg {
            Ok(Incoming::Known(env)) => {
                warn!(channel = env.tag(), state = %self.state, "unexpected envelope ignored")
            }
            Ok(Incoming::Unknown { channel, .. }) => warn!(%channel, "unknown envelope ignored"),
            Err(e) => warn!(label = e.as_label(), error = %e, "bad envelope ignored"),
        }
    }

    fn enter(&mut self, next: WorkerState) {
        debug!(from = %self.state, to = %next, "worker state");
        self.state = next;
    }
}

/// Runs a worker to completion and maps the outcome to a process exit status.
pub async fn run_worker<R, W>(
    role: Role,
    reader: R,
    writer: W,
    connector: Arc<dyn Connector>,
) -> ExitCode
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match WorkerRuntime::new(role, reader, writer, connector).run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(_) => ExitCode::FAILURE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::fake_broker::Session;
    use crate::bus::{LibraryConnector, MemoryBus, Payload};
    use crate::config::{ErrorPolicy, RunConfig};
    use crate::error::BusError;
    use crate::protocol::ReportSample;
    use std::time::Duration;
    use tokio::io::DuplexStream;
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    struct Harness {
        to_worker: Option<EnvelopeSink<DuplexStream, ToWorker>>,
        from_worker: EnvelopeStream<DuplexStream, ToSupervisor>,
        handle: JoinHandle<Result<(), WorkerError>>,
    }

    impl Harness {
        fn start(role: Role, bus: &MemoryBus) -> Self {
            Self::with_connector(role, Arc::new(bus.clone()))
        }

        fn with_connector(role: Role, connector: Arc<dyn Connector>) -> Self {
            let (sup_w, worker_r) = tokio::io::duplex(64 * 1024);
            let (worker_w, sup_r) = tokio::io::duplex(64 * 1024);
            let runtime = WorkerRuntime::new(role, worker_r, worker_w, connector);
            Self {
                to_worker: Some(EnvelopeSink::new(sup_w)),
                from_worker: EnvelopeStream::new(sup_r),
                handle: tokio::spawn(runtime.run()),
            }
        }

        async fn send(&mut self, env: ToWorker) {
            self.to_worker.as_mut().unwrap().send(&env).await.unwrap();
        }

        async fn recv(&mut self) -> ToSupervisor {
            match self.from_worker.next().await.unwrap().unwrap() {
                Incoming::Known(env) => env,
                other => panic!("unexpected {other:?}"),
            }
        }

        async fn handshake(&mut self, cfg: WorkerConfig) {
            assert_eq!(self.recv().await, ToSupervisor::Started);
            self.send(ToWorker::Config(Box::new(cfg))).await;
            assert_eq!(self.recv().await, ToSupervisor::Ready);
            self.send(ToWorker::Run).await;
        }

        /// Sums reports until `done` holds.
        async fn until(&mut self, totals: &mut Totals, done: impl Fn(&Totals) -> bool) {
            while !done(totals) {
                if let ToSupervisor::Report(sample) = self.recv().await {
                    totals.add(sample);
                }
            }
        }

        /// Reads until `ended`, summing every report on the way.
        async fn until_ended(&mut self, totals: &mut Totals) -> Option<String> {
            loop {
                match self.recv().await {
                    ToSupervisor::Report(sample) => totals.add(sample),
                    ToSupervisor::Ended(reason) => return reason,
                    _ => {}
                }
            }
        }
    }

    #[derive(Default, Debug)]
    struct Totals {
        sent: u64,
        received: u64,
        retried: u64,
    }

    impl Totals {
        fn add(&mut self, sample: ReportSample) {
            match sample {
                ReportSample::Producer { sent } => self.sent += sent,
                ReportSample::Consumer { received, retried } => {
                    self.received += received;
                    self.retried += retried;
                }
            }
        }
    }

    fn run_config() -> RunConfig {
        RunConfig {
            topic: "bench".into(),
            channel: "wd40".into(),
            worker_min_report_delay_ms: 10,
            worker_max_report_delay_ms: 50,
            ..RunConfig::default()
        }
    }

    #[tokio::test]
    async fn test_producer_reports_every_published_message() {
        let bus = MemoryBus::new();
        let mut w = Harness::start(Role::Producer, &bus);
        w.handshake(run_config().worker(0, Role::Producer)).await;

        let mut totals = Totals::default();
        loop {
            if let ToSupervisor::Report(sample) = w.recv().await {
                totals.add(sample);
                if totals.sent > 0 {
                    break;
                }
            }
        }
        w.send(ToWorker::Halt).await;

        assert_eq!(w.until_ended(&mut totals).await, None);
        assert!(w.handle.await.unwrap().is_ok());
        assert_eq!(totals.sent, bus.stats().published);
    }

    #[tokio::test]
    async fn test_halt_before_run_aborts() {
        let bus = MemoryBus::new();
        let mut w = Harness::start(Role::Producer, &bus);
        assert_eq!(w.recv().await, ToSupervisor::Started);
        w.send(ToWorker::Config(Box::new(run_config().worker(1, Role::Producer))))
            .await;
        assert_eq!(w.recv().await, ToSupervisor::Ready);
        w.send(ToWorker::Halt).await;

        assert!(matches!(w.recv().await, ToSupervisor::Error(f) if f.label == "worker_halted_before_run"));
        assert!(matches!(w.recv().await, ToSupervisor::Ended(Some(_))));
        assert!(matches!(
            w.handle.await.unwrap(),
            Err(WorkerError::HaltedBeforeRun)
        ));
        assert_eq!(bus.stats().published, 0);
    }

    #[tokio::test]
    async fn test_setup_failure_never_reports_ready() {
        let bus = MemoryBus::new();
        bus.refuse_connections(true);
        let mut w = Harness::start(Role::Consumer, &bus);
        assert_eq!(w.recv().await, ToSupervisor::Started);
        w.send(ToWorker::Config(Box::new(run_config().worker(2, Role::Consumer))))
            .await;

        assert!(matches!(w.recv().await, ToSupervisor::Error(f) if f.label == "worker_setup"));
        assert!(matches!(w.recv().await, ToSupervisor::Ended(Some(_))));
        assert!(matches!(w.handle.await.unwrap(), Err(WorkerError::Setup(_))));
    }

    #[tokio::test]
    async fn test_consumer_counts_retries_and_finishes_held_units_on_halt() {
        let bus = MemoryBus::new();
        let mut w = Harness::start(Role::Consumer, &bus);
        let cfg = RunConfig {
            ack_delay_ms: 60_000,
            remind_interval_ms: 20_000,
            ..run_config()
        };
        w.handshake(cfg.worker(3, Role::Consumer)).await;

        let publisher = bus
            .publisher(&run_config().worker(9, Role::Producer))
            .await
            .unwrap();
        publisher
            .publish("bench", &Payload::build(16, 5))
            .await
            .unwrap();
        bus.redeliver("bench", "again", 2);

        let mut totals = Totals::default();
        while totals.received < 6 {
            if let ToSupervisor::Report(sample) = w.recv().await {
                totals.add(sample);
            }
        }
        assert_eq!(bus.stats().finished, 0, "units are held for the ack delay");

        w.send(ToWorker::Halt).await;
        assert_eq!(w.until_ended(&mut totals).await, None);
        assert!(w.handle.await.unwrap().is_ok());
        assert_eq!(totals.received, 6);
        assert_eq!(totals.retried, 1);
        assert_eq!(bus.stats().finished, 6);
    }

    #[tokio::test]
    async fn test_consumer_stops_when_bus_closes() {
        let bus = MemoryBus::new();
        let mut w = Harness::start(Role::Consumer, &bus);
        w.handshake(run_config().worker(4, Role::Consumer)).await;

        bus.close();
        let mut totals = Totals::default();
        let reason = w.until_ended(&mut totals).await;
        assert!(reason.is_some_and(|r| r.contains("closed")));
        assert!(matches!(
            w.handle.await.unwrap(),
            Err(WorkerError::ConnectionLost)
        ));
    }

    #[tokio::test]
    async fn test_publish_failure_under_halt_policy_ends_worker() {
        let bus = MemoryBus::new();
        bus.reject_next_publishes(1);
        let mut w = Harness::start(Role::Producer, &bus);
        let cfg = RunConfig {
            on_error: ErrorPolicy::Halt,
            ..run_config()
        };
        w.handshake(cfg.worker(5, Role::Producer)).await;

        let mut totals = Totals::default();
        let reason = w.until_ended(&mut totals).await;
        assert!(reason.is_some_and(|r| r.contains("E_PUB_FAILED")));
        assert_eq!(totals.sent, 0);
        assert!(matches!(w.handle.await.unwrap(), Err(WorkerError::Bus(_))));
    }

    #[tokio::test]
    async fn test_swallowed_publish_failure_keeps_producing() {
        let bus = MemoryBus::new();
        bus.reject_next_publishes(3);
        let mut w = Harness::start(Role::Producer, &bus);
        w.handshake(run_config().worker(6, Role::Producer)).await;

        let mut totals = Totals::default();
        while totals.sent == 0 {
            if let ToSupervisor::Report(sample) = w.recv().await {
                totals.add(sample);
            }
        }
        w.send(ToWorker::Halt).await;
        assert_eq!(w.until_ended(&mut totals).await, None);
        assert_eq!(totals.sent, bus.stats().published);
    }

    #[tokio::test]
    async fn test_consumer_receives_everything_the_producer_sent() {
        let bus = MemoryBus::new();
        let mut consumer = Harness::start(Role::Consumer, &bus);
        consumer
            .handshake(run_config().worker(10, Role::Consumer))
            .await;
        let mut producer = Harness::start(Role::Producer, &bus);
        producer
            .handshake(run_config().worker(11, Role::Producer))
            .await;

        let mut sent = Totals::default();
        producer.until(&mut sent, |t| t.sent >= 500).await;
        producer.send(ToWorker::Halt).await;
        assert_eq!(producer.until_ended(&mut sent).await, None);

        let mut got = Totals::default();
        tokio::time::timeout(
            Duration::from_secs(5),
            consumer.until(&mut got, |t| t.received >= sent.sent),
        )
        .await
        .expect("consumer never caught up");
        consumer.send(ToWorker::Halt).await;
        assert_eq!(consumer.until_ended(&mut got).await, None);

        assert_eq!(got.received, sent.sent);
        assert_eq!(got.retried, 0);
        assert_eq!(bus.stats().published, sent.sent);
        assert_eq!(bus.stats().finished, sent.sent);
    }

    /// Broker that fails the first `FIN`, then keeps delivering until `CLS`.
    async fn failing_finish_broker(listener: TcpListener) -> Vec<String> {
        let mut session = Session::accept(&listener).await;
        assert_eq!(session.line().await, "SUB bench wd40\n");
        session.ok().await;
        assert_eq!(session.line().await, "RDY 1\n");
        session.message(b"0000000000000001", 1, b"one").await;
        assert_eq!(session.line().await, "FIN 0000000000000001\n");
        session.error(b"E_FIN_FAILED").await;
        session.message(b"0000000000000002", 1, b"two").await;
        session.lines_until("CLS\n").await
    }

    async fn nsq_consumer(on_error: ErrorPolicy) -> (Harness, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let broker = tokio::spawn(failing_finish_broker(listener));

        let mut w = Harness::with_connector(Role::Consumer, Arc::new(LibraryConnector));
        let cfg = RunConfig {
            host: "127.0.0.1".into(),
            port,
            on_error,
            ..run_config()
        };
        w.handshake(cfg.worker(12, Role::Consumer)).await;
        (w, broker)
    }

    #[tokio::test]
    async fn test_failed_finish_under_halt_policy_ends_consumer() {
        let (mut w, broker) = nsq_consumer(ErrorPolicy::Halt).await;

        let mut totals = Totals::default();
        let reason = w.until_ended(&mut totals).await;
        assert!(reason.is_some_and(|r| r.contains("E_FIN_FAILED")));
        assert!(matches!(
            w.handle.await.unwrap(),
            Err(WorkerError::Bus(BusError::Rejected(_)))
        ));
        assert_eq!(broker.await.unwrap().last().map(String::as_str), Some("CLS\n"));
    }

    #[tokio::test]
    async fn test_swallowed_finish_failure_keeps_consuming() {
        let (mut w, broker) = nsq_consumer(ErrorPolicy::Swallow).await;

        let mut totals = Totals::default();
        w.until(&mut totals, |t| t.received >= 2).await;
        w.send(ToWorker::Halt).await;
        assert_eq!(w.until_ended(&mut totals).await, None);
        assert!(w.handle.await.unwrap().is_ok());
        assert_eq!(totals.received, 2);

        let lines = broker.await.unwrap();
        assert!(lines.contains(&"FIN 0000000000000002\n".to_string()));
        assert_eq!(lines.last().map(String::as_str), Some("CLS\n"));
    }

    #[tokio::test]
    async fn test_control_channel_eof_halts_gracefully() {
        let bus = MemoryBus::new();
        let mut w = Harness::start(Role::Consumer, &bus);
        w.handshake(run_config().worker(7, Role::Consumer)).await;
        w.to_worker = None;

        let mut totals = Totals::default();
        assert_eq!(w.until_ended(&mut totals).await, None);
        assert!(w.handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_role_mismatch_is_config_error() {
        let bus = MemoryBus::new();
        let mut w = Harness::start(Role::Producer, &bus);
        assert_eq!(w.recv().await, ToSupervisor::Started);
        w.send(ToWorker::Config(Box::new(run_config().worker(8, Role::Consumer))))
            .await;

        assert!(matches!(w.recv().await, ToSupervisor::Error(f) if f.label == "worker_config"));
        assert!(matches!(w.recv().await, ToSupervisor::Ended(Some(_))));
    }
}
