//! # Run configuration.
//!
//! Provides [`RunConfig`], the immutable value object assembled once by the
//! supervisor (from CLI flags and `WD40_*` environment variables) and sent
//! verbatim to every worker inside the `config` envelope, wrapped in a
//! [`WorkerConfig`] that adds the worker's identity.
//!
//! ## Sentinel values
//! - `max_reconnect_attempts = 0` → reconnect forever
//! - `ack_delay_ms = 0` → acknowledge deliveries immediately
//! - `remind_interval_ms = 0` → never renew held deliveries

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::policies::{BackoffPolicy, JitterPolicy};

/// Worker role hosted by one child process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Publishes fixed-size batches as fast as the bus accepts them.
    Producer,
    /// Subscribes and acknowledges (optionally after a delay).
    Consumer,
}

impl Role {
    /// Short prefix used to build worker aliases (`pub-3`, `sub-0`).
    pub fn short(&self) -> &'static str {
        match self {
            Role::Producer => "pub",
            Role::Consumer => "sub",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Producer => "producer",
            Role::Consumer => "consumer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "producer" | "pub" => Ok(Role::Producer),
            "consumer" | "sub" => Ok(Role::Consumer),
            other => Err(format!("unknown role '{other}' (expected producer | consumer)")),
        }
    }
}

/// Bus client backend used by a role.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Library {
    /// Built-in NSQ TCP client.
    #[default]
    Nsq,
    /// Accepts publishes without I/O and never delivers; measures harness overhead.
    Null,
}

impl fmt::Display for Library {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Library::Nsq => "nsq",
            Library::Null => "null",
        })
    }
}

impl FromStr for Library {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nsq" => Ok(Library::Nsq),
            "null" => Ok(Library::Null),
            other => Err(format!("unknown library '{other}' (expected nsq | null)")),
        }
    }
}

/// What a worker does when a single steady-state bus operation fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPolicy {
    /// Log the failure and keep generating traffic.
    #[default]
    Swallow,
    /// Halt the worker and report the failure as the `ended` reason.
    Halt,
}

impl fmt::Display for ErrorPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorPolicy::Swallow => "swallow",
            ErrorPolicy::Halt => "halt",
        })
    }
}

impl FromStr for ErrorPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "swallow" => Ok(ErrorPolicy::Swallow),
            "halt" => Ok(ErrorPolicy::Halt),
            other => Err(format!("unknown error policy '{other}' (expected swallow | halt)")),
        }
    }
}

/// Configuration shared by the supervisor and every worker of a run.
///
/// ## Field semantics
/// - `qos`: max delivered-but-unacknowledged messages per consumer (`RDY` count)
/// - `message_size` / `batch_size`: payload bytes and messages per publish
/// - `lib`, `pub_lib`, `sub_lib`: backend selection; role-specific overrides win
/// - `min/max_report_delay_ms`: supervisor console throttle bounds
/// - `worker_min/max_report_delay_ms`: per-worker report throttle bounds
/// - `ack_delay_ms`, `remind_interval_ms`: consumer deferred acknowledgment
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    pub host: String,
    pub port: u16,
    pub qos: u32,
    pub message_size: usize,
    pub batch_size: usize,
    pub topic: String,
    pub channel: String,

    pub lib: Library,
    pub pub_lib: Option<Library>,
    pub sub_lib: Option<Library>,

    pub publisher_count: usize,
    pub subscriber_count: usize,

    pub min_report_delay_ms: u64,
    pub max_report_delay_ms: u64,
    pub worker_min_report_delay_ms: u64,
    pub worker_max_report_delay_ms: u64,

    pub deflate: bool,
    pub snappy: bool,

    pub max_reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_delay_ms: u64,

    pub ack_delay_ms: u64,
    pub remind_interval_ms: u64,

    pub on_error: ErrorPolicy,
}

impl Default for RunConfig {
    /// Defaults mirror the command-line defaults:
    /// `localhost:4150`, qos 1, 64-byte messages, batches of 1,
    /// one producer and one consumer, console reports every 1s..5s.
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 4150,
            qos: 1,
            message_size: 64,
            batch_size: 1,
            topic: "bench#ephemeral".to_string(),
            channel: "wd40#ephemeral".to_string(),
            lib: Library::Nsq,
            pub_lib: None,
            sub_lib: None,
            publisher_count: 1,
            subscriber_count: 1,
            min_report_delay_ms: 1_000,
            max_report_delay_ms: 5_000,
            worker_min_report_delay_ms: 250,
            worker_max_report_delay_ms: 1_000,
            deflate: false,
            snappy: false,
            max_reconnect_attempts: 0,
            reconnect_delay_ms: 100,
            max_reconnect_delay_ms: 30_000,
            ack_delay_ms: 0,
            remind_interval_ms: 0,
            on_error: ErrorPolicy::Swallow,
        }
    }
}

impl RunConfig {
    /// Rejects values that would make the run meaningless or stall it.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::invalid("host", "must not be empty"));
        }
        if self.qos == 0 {
            return Err(ConfigError::invalid("qos", "must be at least 1"));
        }
        if self.message_size == 0 {
            return Err(ConfigError::invalid("message_size", "must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::invalid("batch_size", "must be at least 1"));
        }
        if self.topic.is_empty() {
            return Err(ConfigError::invalid("topic", "must not be empty"));
        }
        if self.channel.is_empty() {
            return Err(ConfigError::invalid("channel", "must not be empty"));
        }
        if self.publisher_count == 0 && self.subscriber_count == 0 {
            return Err(ConfigError::invalid(
                "publisher_count",
                "at least one producer or consumer is required",
            ));
        }
        if self.min_report_delay_ms > self.max_report_delay_ms {
            return Err(ConfigError::invalid(
                "min_report_delay",
                format!(
                    "{}ms exceeds max report delay {}ms",
                    self.min_report_delay_ms, self.max_report_delay_ms
                ),
            ));
        }
        if self.worker_min_report_delay_ms > self.worker_max_report_delay_ms {
            return Err(ConfigError::invalid(
                "worker_min_report_delay",
                format!(
                    "{}ms exceeds worker max report delay {}ms",
                    self.worker_min_report_delay_ms, self.worker_max_report_delay_ms
                ),
            ));
        }
        if self.max_reconnect_delay_ms < self.reconnect_delay_ms {
            return Err(ConfigError::invalid(
                "max_reconnect_delay",
                "must not be lower than reconnect delay",
            ));
        }
        Ok(())
    }

    /// `host:port` of the broker.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Backend for the given role (role override, falling back to `lib`).
    pub fn library_for(&self, role: Role) -> Library {
        match role {
            Role::Producer => self.pub_lib.unwrap_or(self.lib),
            Role::Consumer => self.sub_lib.unwrap_or(self.lib),
        }
    }

    /// Supervisor console throttle bounds `(min, max)`.
    pub fn report_bounds(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.min_report_delay_ms),
            Duration::from_millis(self.max_report_delay_ms),
        )
    }

    /// Worker report throttle bounds `(min, max)`.
    pub fn worker_report_bounds(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.worker_min_report_delay_ms),
            Duration::from_millis(self.worker_max_report_delay_ms),
        )
    }

    /// Returns the acknowledgment delay as an `Option` (`None` → finish immediately).
    #[inline]
    pub fn ack_delay(&self) -> Option<Duration> {
        (self.ack_delay_ms > 0).then(|| Duration::from_millis(self.ack_delay_ms))
    }

    /// Returns the renewal interval as an `Option` (`None` → never renew).
    #[inline]
    pub fn remind_interval(&self) -> Option<Duration> {
        (self.remind_interval_ms > 0).then(|| Duration::from_millis(self.remind_interval_ms))
    }

    /// Returns the reconnect attempt limit as an `Option` (`None` → unlimited).
    #[inline]
    pub fn reconnect_limit(&self) -> Option<u32> {
        (self.max_reconnect_attempts > 0).then_some(self.max_reconnect_attempts)
    }

    /// Reconnection delays: doubling from `reconnect_delay`, capped at `max_reconnect_delay`.
    pub fn reconnect_backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            first: Duration::from_millis(self.reconnect_delay_ms),
            max: Duration::from_millis(self.max_reconnect_delay_ms),
            factor: 2.0,
            jitter: JitterPolicy::Equal,
        }
    }

    /// Total number of workers the run launches.
    pub fn worker_count(&self) -> usize {
        self.publisher_count + self.subscriber_count
    }

    /// Wraps a copy of this configuration with a worker identity.
    pub fn worker(&self, id: u32, role: Role) -> WorkerConfig {
        WorkerConfig {
            id,
            alias: format!("{}-{}", role.short(), id),
            role,
            run: self.clone(),
        }
    }
}

/// Payload of the `config` envelope: the run configuration plus identity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub id: u32,
    pub alias: String,
    pub role: Role,
    #[serde(flatten)]
    pub run: RunConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert_eq!(RunConfig::default().validate(), Ok(()));
    }

    #[test]
    fn test_rejects_inverted_report_bounds() {
        let cfg = RunConfig {
            min_report_delay_ms: 5_000,
            max_report_delay_ms: 1_000,
            ..RunConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.as_label(), "config_invalid");
        assert!(err.to_string().contains("min_report_delay"));
    }

    #[test]
    fn test_rejects_empty_run() {
        let cfg = RunConfig {
            publisher_count: 0,
            subscriber_count: 0,
            ..RunConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_role_library_override() {
        let cfg = RunConfig {
            lib: Library::Nsq,
            sub_lib: Some(Library::Null),
            ..RunConfig::default()
        };
        assert_eq!(cfg.library_for(Role::Producer), Library::Nsq);
        assert_eq!(cfg.library_for(Role::Consumer), Library::Null);
    }

    #[test]
    fn test_zero_sentinels() {
        let cfg = RunConfig::default();
        assert_eq!(cfg.ack_delay(), None);
        assert_eq!(cfg.remind_interval(), None);
        assert_eq!(cfg.reconnect_limit(), None);

        let cfg = RunConfig {
            ack_delay_ms: 1_500,
            remind_interval_ms: 500,
            max_reconnect_attempts: 3,
            ..RunConfig::default()
        };
        assert_eq!(cfg.ack_delay(), Some(Duration::from_millis(1_500)));
        assert_eq!(cfg.remind_interval(), Some(Duration::from_millis(500)));
        assert_eq!(cfg.reconnect_limit(), Some(3));
    }

    #[test]
    fn test_worker_config_carries_identity_and_flattens() {
        let wc = RunConfig::default().worker(3, Role::Consumer);
        assert_eq!(wc.alias, "sub-3");

        let json = serde_json::to_value(&wc).unwrap();
        assert_eq!(json["id"], 3);
        assert_eq!(json["role"], "consumer");
        assert_eq!(json["topic"], "bench#ephemeral");

        let back: WorkerConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, wc);
    }

    #[test]
    fn test_parse_enums() {
        assert_eq!("pub".parse::<Role>(), Ok(Role::Producer));
        assert_eq!("null".parse::<Library>(), Ok(Library::Null));
        assert_eq!("halt".parse::<ErrorPolicy>(), Ok(ErrorPolicy::Halt));
        assert!("squeaky".parse::<Library>().is_err());
    }
}
