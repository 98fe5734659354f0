//! # Worker launchers.
//!
//! A [`Launcher`] starts one worker and returns its [`WorkerLink`]: the two
//! ends of the envelope channel plus a handle to wait for the worker's exit.
//!
//! ```text
//! ProcessLauncher ──► <current exe> worker --role pub|sub
//!                       stdin  ◄── supervisor → worker envelopes
//!                       stdout ──► worker → supervisor envelopes
//!                       stderr ──► inherited (worker logs)
//! TaskLauncher    ──► run_worker() on a tokio task over in-memory pipes
//! ```
//!
//! Halting is cooperative in both cases: nothing here kills a worker.

use std::io;
use std::path::PathBuf;
use std::process::{ExitCode, Stdio};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bus::Connector;
use crate::config::Role;
use crate::worker::run_worker;

/// Pipe buffer of in-process workers.
const TASK_PIPE_BYTES: usize = 64 * 1024;

/// Handle used to wait for a worker's exit once it ended.
pub enum WorkerHandle {
    Process(Child),
    Task(JoinHandle<ExitCode>),
    /// Lifetime not tracked by the supervisor.
    Detached,
}

impl WorkerHandle {
    /// Waits for the worker to exit and logs how it went.
    pub async fn wait(self, alias: String) {
        match self {
            WorkerHandle::Process(mut child) => match child.wait().await {
                Ok(status) if status.success() => debug!(worker = %alias, "worker exited"),
                Ok(status) => warn!(worker = %alias, %status, "worker exited with failure"),
                Err(e) => warn!(worker = %alias, error = %e, "could not wait for worker"),
            },
            WorkerHandle::Task(task) => match task.await {
                Ok(code) => debug!(worker = %alias, ?code, "worker task finished"),
                Err(e) => warn!(worker = %alias, error = %e, "worker task failed"),
            },
            WorkerHandle::Detached => {}
        }
    }
}

/// Both ends of a freshly launched worker's channel.
pub struct WorkerLink {
    /// Worker → supervisor.
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    /// Supervisor → worker.
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    pub handle: WorkerHandle,
}

/// Starts workers.
pub trait Launcher: Send {
    fn launch(&self, id: u32, role: Role) -> io::Result<WorkerLink>;
}

/// Launches each worker as a child process running the `worker` subcommand.
#[derive(Clone, Debug)]
pub struct ProcessLauncher {
    program: PathBuf,
}

impl ProcessLauncher {
    /// Launches `program worker --role <role>`.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Re-executes the running binary.
    pub fn current_exe() -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }
}

impl Launcher for ProcessLauncher {
    fn launch(&self, id: u32, role: Role) -> io::Result<WorkerLink> {
        let mut child = Command::new(&self.program)
            .arg("worker")
            .arg("--role")
            .arg(role.short())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;

        let missing = |pipe: &str| io::Error::other(format!("worker {id}: {pipe} was not piped"));
        let writer = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let reader = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        debug!(id, pid = ?child.id(), %role, "worker process launched");

        Ok(WorkerLink {
            reader: Box::new(reader),
            writer: Box::new(writer),
            handle: WorkerHandle::Process(child),
        })
    }
}

/// Runs workers as tasks of the current runtime.
#[derive(Clone)]
pub struct TaskLauncher {
    connector: Arc<dyn Connector>,
}

impl TaskLauncher {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self { connector }
    }
}

impl Launcher for TaskLauncher {
    fn launch(&self, _id: u32, role: Role) -> io::Result<WorkerLink> {
        let (sup_writer, worker_reader) = tokio::io::duplex(TASK_PIPE_BYTES);
        let (worker_writer, sup_reader) = tokio::io::duplex(TASK_PIPE_BYTES);
        let task = tokio::spawn(run_worker(
            role,
            worker_reader,
            worker_writer,
            Arc::clone(&self.connector),
        ));

        Ok(WorkerLink {
            reader: Box::new(sup_reader),
            writer: Box::new(sup_writer),
            handle: WorkerHandle::Task(task),
        })
    }
}
