//! # wd40
//!
//! **wd40** is a load generator for publish/subscribe message buses. A
//! supervisor spawns producer and consumer workers, releases them together
//! through a readiness barrier, aggregates their throughput reports and winds
//! them down with a cooperative halt cascade.
//!
//! ## Architecture
//! ```text
//!                      ┌──────────────────────────────────────────┐
//!                      │ Supervisor (one event loop, no locks)    │
//!                      │  - Registry (WorkerDescriptor per id)    │
//!                      │  - readiness barrier                     │
//!                      │  - GlobalCounters + Throttle ─► Console  │
//!                      │  - halt cascade                          │
//!                      └───┬──────────────────┬───────────────────┘
//!        config/run/halt   │  ▲               │  ▲  started/ready/report/error/ended
//!      (JSON lines, stdin) ▼  │ (stdout)      ▼  │
//!                  ┌──────────────────┐  ┌──────────────────┐
//!                  │ worker (pub-N)   │  │ worker (sub-N)   │
//!                  │  WorkerRuntime   │  │  WorkerRuntime   │
//!                  │  Producer loop   │  │  Consumer loop   │
//!                  │  Reporter        │  │  Reporter        │
//!                  │                  │  │  DeferredAcks    │
//!                  └────────┬─────────┘  └────────┬─────────┘
//!                           ▼                     ▼
//!                      ┌──────────────────────────────────┐
//!                      │ bus: NSQ (TCP) │ Null │ Memory   │
//!                      └──────────────────────────────────┘
//! ```
//!
//! ### Lifecycle
//! ```text
//! worker:     INIT ─► AWAIT_CONFIG ─► SETUP ─► WAIT_RUN ─► RUNNING ─► HALTING ─► TERMINATED
//! supervisor: spawned ─► started ─► ready ─► running ─► ended
//! ```
//!
//! ## Modules
//! - [`supervisor`]: [`Supervisor`], launchers, registry and console.
//! - [`worker`]: [`run_worker`], the worker state machine and its roles.
//! - [`protocol`]: envelope types and the newline-delimited JSON channel.
//! - [`bus`]: message-bus collaborator surface and its backends.
//! - [`config`]: [`RunConfig`] and its validation.
//!
//! ## Example
//! ```no_run
//! use std::sync::Arc;
//! use wd40::bus::MemoryBus;
//! use wd40::{Console, RunConfig, Supervisor, TaskLauncher};
//!
//! # async fn demo() -> Result<(), wd40::RuntimeError> {
//! let bus = MemoryBus::new();
//! let launcher = TaskLauncher::new(Arc::new(bus.clone()));
//! let sup = Supervisor::new(RunConfig::default(), Box::new(launcher), Box::new(Console::new()))?;
//! let summary = sup.run().await?;
//! assert_eq!(summary.sent, bus.stats().published);
//! # Ok(())
//! # }
//! ```

mod ack;
mod error;
mod policies;
mod throttle;

pub mod bus;
pub mod config;
pub mod protocol;
pub mod shutdown;
pub mod supervisor;
pub mod telemetry;
pub mod worker;

pub use ack::{AckId, DeferredAcks, Fired, Hold};
pub use config::{ErrorPolicy, Library, Role, RunConfig, WorkerConfig};
pub use error::{BusError, ConfigError, ProtocolError, RuntimeError, WorkerError};
pub use policies::{BackoffPolicy, JitterPolicy};
pub use supervisor::{
    Console, GlobalCounters, Launcher, ProcessLauncher, RunSummary, StatusSink, Supervisor,
    TaskLauncher,
};
pub use throttle::Throttle;
pub use worker::{WorkerRuntime, WorkerState, run_worker};
