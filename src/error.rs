//! Error types used by the wd40 supervisor, workers and bus backends.
//!
//! This module defines one enum per layer:
//!
//! - [`ConfigError`]: a run configuration that cannot be used.
//! - [`ProtocolError`]: the supervisor/worker envelope channel misbehaved.
//! - [`BusError`]: the message-bus collaborator failed or rejected an operation.
//! - [`WorkerError`]: a worker could not complete its lifecycle.
//! - [`RuntimeError`]: the supervisor itself failed.
//!
//! Every enum provides `as_label` (stable snake_case string for logs).

use std::io;

use thiserror::Error;

use crate::config::Role;

/// # Errors produced while validating a run configuration.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A field holds a value outside of its accepted range.
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Name of the offending field (flag name without dashes).
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }

    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            ConfigError::Invalid { .. } => "config_invalid",
        }
    }
}

/// # Errors produced by the envelope channel between supervisor and workers.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The channel was closed before the expected envelope arrived.
    #[error("channel closed while waiting for '{expected}'")]
    Closed {
        /// Channel tag that was being awaited.
        expected: &'static str,
    },

    /// A line could not be decoded as an envelope.
    #[error("malformed envelope: {error}")]
    Malformed {
        /// Decoder message.
        error: String,
    },

    /// An envelope could not be encoded.
    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),

    /// Underlying pipe failure.
    #[error("channel i/o: {0}")]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            ProtocolError::Closed { .. } => "protocol_closed",
            ProtocolError::Malformed { .. } => "protocol_malformed",
            ProtocolError::Encode(_) => "protocol_encode",
            ProtocolError::Io(_) => "protocol_io",
        }
    }
}

/// # Errors produced by a message-bus backend.
///
/// Setup-time failures (connect, subscribe) are fatal to the worker; steady-state
/// failures (a single publish or acknowledgement) are handled according to the configured
/// [`ErrorPolicy`](crate::config::ErrorPolicy).
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum BusError {
    /// Could not establish a connection to the broker.
    #[error("connect to {addr} failed: {error}")]
    Connect {
        /// `host:port` that was dialled.
        addr: String,
        /// Underlying error message.
        error: String,
    },

    /// The broker answered with an error frame (`E_INVALID`, `E_PUB_FAILED`, ...).
    #[error("broker rejected request: {0}")]
    Rejected(String),

    /// The broker sent bytes that do not follow the wire protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The connection is gone and will not be re-established.
    #[error("connection closed")]
    Closed,

    /// Transport failure on an established connection.
    #[error("transport: {0}")]
    Io(#[from] io::Error),
}

impl BusError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            BusError::Connect { .. } => "bus_connect",
            BusError::Rejected(_) => "bus_rejected",
            BusError::Protocol(_) => "bus_protocol",
            BusError::Closed => "bus_closed",
            BusError::Io(_) => "bus_io",
        }
    }
}

/// # Errors that end a worker with a non-zero status.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Role-specific setup failed before the worker announced readiness.
    #[error("setup failed: {0}")]
    Setup(#[source] BusError),

    /// A halt arrived while waiting for `run`; there is nothing to drain.
    #[error("halted before run")]
    HaltedBeforeRun,

    /// A steady-state bus operation failed under `ErrorPolicy::Halt`.
    #[error("bus operation failed: {0}")]
    Bus(#[from] BusError),

    /// The bus connection closed after the worker was running.
    #[error("bus connection closed while running")]
    ConnectionLost,

    /// The received configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The control channel failed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl WorkerError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            WorkerError::Setup(_) => "worker_setup",
            WorkerError::HaltedBeforeRun => "worker_halted_before_run",
            WorkerError::Bus(_) => "worker_bus",
            WorkerError::ConnectionLost => "worker_connection_lost",
            WorkerError::Config(_) => "worker_config",
            WorkerError::Protocol(_) => "worker_protocol",
        }
    }
}

/// # Errors produced by the supervisor runtime.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// The run configuration is unusable.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A worker could not be launched.
    #[error("failed to launch {role} worker #{id}: {error}")]
    Spawn {
        /// Identifier that was reserved for the worker.
        id: u32,
        /// Role of the worker.
        role: Role,
        /// Underlying launch error.
        error: io::Error,
    },

    /// Every inbound channel closed while workers were still registered.
    #[error("inbound queue closed with {live} worker(s) still registered")]
    InboundClosed {
        /// Number of workers that never announced `ended`.
        live: usize,
    },
}

impl RuntimeError {
    /// Returns a short stable label (snake_case) for use in logs.
    ///
    /// # Example
    /// ```
    /// use wd40::RuntimeError;
    ///
    /// let err = RuntimeError::InboundClosed { live: 2 };
    /// assert_eq!(err.as_label(), "runtime_inbound_closed");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            RuntimeError::Config(_) => "runtime_config",
            RuntimeError::Spawn { .. } => "runtime_spawn",
            RuntimeError::InboundClosed { .. } => "runtime_inbound_closed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_error_keeps_bus_source() {
        let err = WorkerError::Setup(BusError::Connect {
            addr: "localhost:4150".into(),
            error: "refused".into(),
        });
        assert_eq!(err.as_label(), "worker_setup");
        assert_eq!(
            err.to_string(),
            "setup failed: connect to localhost:4150 failed: refused"
        );
    }

    #[test]
    fn test_config_error_message() {
        let err = ConfigError::invalid("batch_size", "must be at least 1");
        assert_eq!(err.to_string(), "invalid batch_size: must be at least 1");
    }
}
