//! # Supervisor: launches workers, gates them on a readiness barrier, aggregates
//! their reports and cascades halts until the last one ended.
//!
//! ## Architecture
//! ```text
//! Supervisor::run()
//!   ├─► StatusSink::banner(cfg)
//!   ├─► spawn(consumer) × S, spawn(producer) × P
//!   │      Launcher::launch() ─► WorkerLink
//!   │        ├─► writer task: outbox (mpsc) ──► EnvelopeSink ──► worker
//!   │        └─► reader task: worker ──► EnvelopeStream ──► inbound (mpsc, tagged with id)
//!   └─► event loop (one task, no locks):
//!         ├─ inbound (id, envelope) ─► on_message()
//!         ├─ throttle due            ─► StatusSink::progress()
//!         └─ shutdown signal         ─► halt_all()
//!
//! on_message(id, envelope)
//!   started ─► send config(cfg + id/alias)
//!   ready   ─► check_barrier(): ready == live ─► broadcast run (once)
//!   report  ─► merge into GlobalCounters ─► throttle.notify()
//!   error   ─► log
//!   ended   ─► on_departure(): deregister
//!                 ├─ live == 0 ─► forced final flush ─► run complete
//!                 └─ live  > 0 ─► check_barrier() ─► halt_all()
//!   unknown ─► log
//! ```
//!
//! ## Rules
//! - `run` is broadcast at most once, and only when every live worker is ready.
//!   The denominator is the *current* live count: a worker leaving before the
//!   barrier cannot stall the others.
//! - A channel that closes without `ended` counts as `ended("channel closed")`.
//! - Halts are cooperative and may repeat; workers tolerate duplicates.
//! - The final flush happens exactly once, after the last departure.

mod console;
mod launcher;
mod registry;

use std::future::Future;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{Role, RunConfig};
use crate::error::{ProtocolError, RuntimeError};
use crate::protocol::{Envelope, EnvelopeSink, EnvelopeStream, Incoming, ToSupervisor, ToWorker};
use crate::shutdown;
use crate::throttle::Throttle;

pub use console::{Console, FailedWorker, GlobalCounters, RunSummary, StatusSink};
pub use launcher::{Launcher, ProcessLauncher, TaskLauncher, WorkerHandle, WorkerLink};
pub use registry::{ReadyState, Registry, WorkerDescriptor};

/// Reason recorded for a worker whose channel closed without `ended`.
pub const CHANNEL_CLOSED: &str = "channel closed";

/// What a reader task forwards to the event loop.
#[derive(Debug)]
pub enum Inbound {
    Message(Incoming<ToSupervisor>),
    Malformed(ProtocolError),
    Disconnected,
}

/// Orchestrates one run.
pub struct Supervisor {
    cfg: RunConfig,
    launcher: Box<dyn Launcher>,
    sink: Box<dyn StatusSink>,
    registry: Registry,
    counters: GlobalCounters,
    throttle: Throttle,
    run_sent: bool,
    summary: Option<RunSummary>,
    failed: Vec<FailedWorker>,
    started_at: Instant,
    inbound_tx: Option<mpsc::UnboundedSender<(u32, Inbound)>>,
    inbound_rx: mpsc::UnboundedReceiver<(u32, Inbound)>,
    reapers: JoinSet<()>,
}

impl Supervisor {
    /// Validates `cfg` and prepares an idle supervisor.
    pub fn new(
        cfg: RunConfig,
        launcher: Box<dyn Launcher>,
        sink: Box<dyn StatusSink>,
    ) -> Result<Self, RuntimeError> {
        cfg.validate()?;
        let (min, max) = cfg.report_bounds();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Ok(Self {
            cfg,
            launcher,
            sink,
            registry: Registry::new(),
            counters: GlobalCounters::default(),
            throttle: Throttle::new(min, max),
            run_sent: false,
            summary: None,
            failed: Vec::new(),
            started_at: Instant::now(),
            inbound_tx: Some(inbound_tx),
            inbound_rx,
            reapers: JoinSet::new(),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn counters(&self) -> GlobalCounters {
        self.counters
    }

    /// Whether `run` has been broadcast.
    pub fn run_sent(&self) -> bool {
        self.run_sent
    }

    /// Set once the last worker ended.
    pub fn summary(&self) -> Option<&RunSummary> {
        self.summary.as_ref()
    }

    /// Launches and registers one worker; returns its id.
    ///
    /// The worker's [`WorkerDescriptor`] (alias, role, readiness) is then
    /// available through `registry().get(id)`.
    pub fn spawn(&mut self, role: Role) -> Result<u32, RuntimeError> {
        let Some(inbound) = self.inbound_tx.clone() else {
            return Err(RuntimeError::InboundClosed {
                live: self.registry.live(),
            });
        };
        let id = self.registry.reserve_id();
        let link = self
            .launcher
            .launch(id, role)
            .map_err(|error| RuntimeError::Spawn { id, role, error })?;

        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let desc = WorkerDescriptor::new(id, role, outbox, link.handle);
        spawn_writer(desc.alias.clone(), link.writer, outbox_rx);
        spawn_reader(id, link.reader, inbound);

        info!(worker = %desc.alias, %role, "worker spawned");
        self.registry.insert(desc);
        Ok(id)
    }

    /// Routes one envelope from worker `id`.
    pub fn on_message(&mut self, id: u32, msg: Incoming<ToSupervisor>) {
        let env = match msg {
            Incoming::Known(env) => env,
            Incoming::Unknown { channel, .. } => {
                warn!(id, %channel, "unknown envelope ignored");
                return;
            }
        };
        let Some(worker) = self.registry.get_mut(id) else {
            debug!(id, channel = env.tag(), "envelope from departed worker ignored");
            return;
        };

        match env {
            ToSupervisor::Started => {
                if worker.advance(ReadyState::Started) {
                    let cfg = self.cfg.worker(id, worker.role);
                    worker.send(ToWorker::Config(Box::new(cfg)));
                } else {
                    warn!(worker = %worker.alias, state = %worker.state(), "unexpected started ignored");
                }
            }
            ToSupervisor::Ready => {
                if worker.advance(ReadyState::Ready) {
                    debug!(worker = %worker.alias, "worker ready");
                    self.check_barrier();
                } else {
                    warn!(worker = %worker.alias, state = %worker.state(), "unexpected ready ignored");
                }
            }
            ToSupervisor::Report(sample) => {
                self.counters.merge(sample);
                self.throttle.notify(Instant::now());
                self.flush_if_due();
            }
            ToSupervisor::Error(failure) => {
                warn!(
                    worker = %worker.alias,
                    label = %failure.label,
                    error = %failure.message,
                    "worker reported an error"
                );
            }
            ToSupervisor::Ended(reason) => self.on_departure(id, reason),
        }
    }

    /// Deregisters worker `id`; completes the run or keeps the cascade going.
    pub fn on_departure(&mut self, id: u32, reason: Option<String>) {
        let Some(mut desc) = self.registry.deregister(id) else {
            return;
        };
        match &reason {
            None => info!(worker = %desc.alias, "worker ended"),
            Some(r) => warn!(worker = %desc.alias, reason = %r, "worker ended with failure"),
        }
        if let Some(reason) = reason {
            self.failed.push(FailedWorker {
                alias: desc.alias.clone(),
                reason,
            });
        }
        if let Some(handle) = desc.take_handle() {
            self.reapers.spawn(handle.wait(desc.alias.clone()));
        }

        if self.registry.live() == 0 {
            self.complete();
        } else {
            self.check_barrier();
            self.halt_all();
        }
    }

    /// Sends `halt` to every live worker.
    pub fn halt_all(&mut self) {
        let live = self.registry.live();
        debug!(live, "halting workers");
        for worker in self.registry.iter() {
            if !worker.send(ToWorker::Halt) {
                debug!(worker = %worker.alias, "halt not delivered; channel closed");
            }
        }
    }

    /// Runs until the last worker ended or an OS termination signal cascaded a halt.
    pub async fn run(self) -> Result<RunSummary, RuntimeError> {
        let signal = async {
            if let Err(e) = shutdown::wait_for_shutdown_signal().await {
                warn!(error = %e, "signal handlers unavailable; run stops only when workers end");
                std::future::pending::<()>().await;
            }
        };
        self.run_until(signal).await
    }

    /// Like [`Supervisor::run`], with `stop` standing in for the operator signal.
    pub async fn run_until<F>(mut self, stop: F) -> Result<RunSummary, RuntimeError>
    where
        F: Future<Output = ()>,
    {
        self.sink.banner(&self.cfg);
        self.started_at = Instant::now();

        let roles = std::iter::repeat_n(Role::Consumer, self.cfg.subscriber_count)
            .chain(std::iter::repeat_n(Role::Producer, self.cfg.publisher_count));
        let mut launch_error = None;
        for role in roles {
            if let Err(e) = self.spawn(role) {
                warn!(error = %e, "launch failed; halting the workers already running");
                launch_error = Some(e);
                break;
            }
        }
        // reader tasks hold the remaining senders
        self.inbound_tx = None;

        if let Some(e) = launch_error {
            if self.registry.live() == 0 {
                return Err(e);
            }
            self.halt_all();
        }

        tokio::pin!(stop);
        let mut stopping = false;
        while self.summary.is_none() {
            tokio::select! {
                _ = &mut stop, if !stopping => {
                    info!("shutdown requested; halting workers");
                    stopping = true;
                    self.halt_all();
                }
                inbound = self.inbound_rx.recv() => match inbound {
                    Some((id, inbound)) => self.on_inbound(id, inbound),
                    None => {
                        return Err(RuntimeError::InboundClosed {
                            live: self.registry.live(),
                        });
                    }
                },
                _ = self.throttle.due() => self.flush_if_due(),
            }
        }

        while self.reapers.join_next().await.is_some() {}
        let summary = self.summary.take().ok_or(RuntimeError::InboundClosed { live: 0 })?;
        Ok(summary)
    }

    fn on_inbound(&mut self, id: u32, inbound: Inbound) {
        match inbound {
            Inbound::Message(msg) => self.on_message(id, msg),
            Inbound::Malformed(e) => {
                warn!(id, label = e.as_label(), error = %e, "malformed envelope ignored");
            }
            Inbound::Disconnected => {
                if self.registry.get(id).is_some() {
                    warn!(id, "worker channel closed without 'ended'");
                    self.on_departure(id, Some(CHANNEL_CLOSED.to_string()));
                }
            }
        }
    }

    fn check_barrier(&mut self) {
        let live = self.registry.live();
        if self.run_sent || live == 0 || self.registry.ready() != live {
            return;
        }
        self.run_sent = true;
        info!(workers = live, "all workers ready; starting run");
        for worker in self.registry.iter_mut() {
            worker.advance(ReadyState::Running);
            worker.send(ToWorker::Run);
        }
    }

    fn flush_if_due(&mut self) {
        if self.throttle.try_flush(Instant::now()) {
            self.sink.progress(&self.counters, self.started_at.elapsed());
        }
    }

    fn complete(&mut self) {
        if self.summary.is_some() {
            return;
        }
        self.throttle.force_flush(Instant::now());
        let summary = RunSummary {
            sent: self.counters.sent,
            received: self.counters.received,
            retried: self.counters.retried,
            elapsed: self.started_at.elapsed(),
            failed_workers: std::mem::take(&mut self.failed),
        };
        self.sink.finished(&summary);
        info!(
            sent = summary.sent,
            received = summary.received,
            failed = summary.failed_workers.len(),
            "run complete"
        );
        self.summary = Some(summary);
    }
}

fn spawn_writer<W>(alias: String, writer: W, mut outbox: mpsc::UnboundedReceiver<ToWorker>)
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut sink = EnvelopeSink::<_, ToWorker>::new(writer);
        while let Some(env) = outbox.recv().await {
            if let Err(e) = sink.send(&env).await {
                debug!(worker = %alias, error = %e, "worker channel closed for writing");
                break;
            }
        }
    });
}

fn spawn_reader<R>(id: u32, reader: R, inbound: mpsc::UnboundedSender<(u32, Inbound)>)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut stream = EnvelopeStream::<_, ToSupervisor>::new(reader);
        loop {
            let (item, last) = match stream.next().await {
                Some(Ok(msg)) => (Inbound::Message(msg), false),
                Some(Err(ProtocolError::Io(e))) => {
                    debug!(id, error = %e, "worker channel read failed");
                    (Inbound::Disconnected, true)
                }
                Some(Err(e)) => (Inbound::Malformed(e), false),
                None => (Inbound::Disconnected, true),
            };
            if inbound.send((id, item)).is_err() || last {
                break;
            }
        }
    });
}
