//! # Envelope types exchanged between the supervisor and its workers.
//!
//! [`ToSupervisor`] and [`ToWorker`] are adjacently tagged: the variant name
//! becomes the `channel` field and its payload the `message` field.
//!
//! ## Example
//! ```rust
//! use wd40::protocol::{Incoming, ReportSample, ToSupervisor, decode};
//!
//! let line = r#"{"channel":"report","message":{"role":"producer","sent":12}}"#;
//! let env = decode::<ToSupervisor>(line).unwrap();
//! assert_eq!(
//!     env,
//!     Incoming::Known(ToSupervisor::Report(ReportSample::Producer { sent: 12 }))
//! );
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{Role, WorkerConfig};
use crate::error::ProtocolError;

/// A direction of the envelope channel.
pub trait Envelope: Serialize + DeserializeOwned {
    /// Channel tags this direction understands.
    const TAGS: &'static [&'static str];

    /// Channel tag of this envelope.
    fn tag(&self) -> &'static str;
}

/// Role-tagged counters accumulated by a worker between two reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum ReportSample {
    Producer { sent: u64 },
    Consumer { received: u64, retried: u64 },
}

impl ReportSample {
    /// Zero-valued counters for `role`.
    pub fn zero(role: Role) -> Self {
        match role {
            Role::Producer => ReportSample::Producer { sent: 0 },
            Role::Consumer => ReportSample::Consumer {
                received: 0,
                retried: 0,
            },
        }
    }

    pub fn role(&self) -> Role {
        match self {
            ReportSample::Producer { .. } => Role::Producer,
            ReportSample::Consumer { .. } => Role::Consumer,
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::zero(self.role())
    }

    /// Returns the accumulated counters and resets `self` to zero.
    pub fn take(&mut self) -> Self {
        std::mem::replace(self, Self::zero(self.role()))
    }
}

/// Failure details carried by the `error` channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    /// Stable snake_case label of the error.
    pub label: String,
    /// Human-readable description.
    pub message: String,
}

/// Envelopes sent by a worker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "channel", content = "message", rename_all = "lowercase")]
pub enum ToSupervisor {
    /// Process is up and waiting for its configuration.
    Started,
    /// Setup finished; waiting for `run`.
    Ready,
    /// Counters accumulated since the previous report.
    Report(ReportSample),
    /// A failure worth surfacing; not fatal by itself.
    Error(Failure),
    /// Last envelope of a worker; `Some(reason)` means it ended in failure.
    Ended(Option<String>),
}

impl Envelope for ToSupervisor {
    const TAGS: &'static [&'static str] = &["started", "ready", "report", "error", "ended"];

    fn tag(&self) -> &'static str {
        match self {
            ToSupervisor::Started => "started",
            ToSupervisor::Ready => "ready",
            ToSupervisor::Report(_) => "report",
            ToSupervisor::Error(_) => "error",
            ToSupervisor::Ended(_) => "ended",
        }
    }
}

/// Envelopes sent by the supervisor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "channel", content = "message", rename_all = "lowercase")]
pub enum ToWorker {
    /// Run configuration plus the worker's identity.
    Config(Box<WorkerConfig>),
    /// Readiness barrier released; start traffic.
    Run,
    /// Stop cooperatively. Idempotent.
    Halt,
}

impl Envelope for ToWorker {
    const TAGS: &'static [&'static str] = &["config", "run", "halt"];

    fn tag(&self) -> &'static str {
        match self {
            ToWorker::Config(_) => "config",
            ToWorker::Run => "run",
            ToWorker::Halt => "halt",
        }
    }
}

/// A decoded line: either a recognized envelope or an unknown channel tag.
#[derive(Clone, Debug, PartialEq)]
pub enum Incoming<T> {
    Known(T),
    Unknown { channel: String, message: Value },
}

/// Decodes one line of the channel.
///
/// Unrecognized tags are not an error: they come back as [`Incoming::Unknown`].
/// A recognized tag with a payload that does not fit is [`ProtocolError::Malformed`].
pub fn decode<T: Envelope>(line: &str) -> Result<Incoming<T>, ProtocolError> {
    let mut value: Value = serde_json::from_str(line).map_err(malformed)?;
    let channel = match value.get("channel").and_then(Value::as_str) {
        Some(c) => c.to_string(),
        None => {
            return Err(ProtocolError::Malformed {
                error: "missing 'channel' tag".to_string(),
            });
        }
    };

    if !T::TAGS.contains(&channel.as_str()) {
        let message = value
            .get_mut("message")
            .map(Value::take)
            .unwrap_or(Value::Null);
        return Ok(Incoming::Unknown { channel, message });
    }

    serde_json::from_value(value)
        .map(Incoming::Known)
        .map_err(malformed)
}

fn malformed(e: serde_json::Error) -> ProtocolError {
    ProtocolError::Malformed {
        error: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfig;
    use serde_json::json;

    #[test]
    fn test_unit_channels_encode_without_payload() {
        let line = serde_json::to_string(&ToSupervisor::Ready).unwrap();
        assert_eq!(line, r#"{"channel":"ready"}"#);
        assert_eq!(
            decode::<ToSupervisor>(&line).unwrap(),
            Incoming::Known(ToSupervisor::Ready)
        );
    }

    #[test]
    fn test_ended_reason_is_optional() {
        let ok = serde_json::to_value(ToSupervisor::Ended(None)).unwrap();
        assert_eq!(ok, json!({"channel": "ended", "message": null}));

        let failed = serde_json::to_value(ToSupervisor::Ended(Some("boom".into()))).unwrap();
        assert_eq!(failed, json!({"channel": "ended", "message": "boom"}));
    }

    #[test]
    fn test_consumer_report_shape() {
        let sample = ReportSample::Consumer {
            received: 7,
            retried: 2,
        };
        let value = serde_json::to_value(ToSupervisor::Report(sample)).unwrap();
        assert_eq!(
            value,
            json!({"channel": "report", "message": {"role": "consumer", "received": 7, "retried": 2}})
        );
    }

    #[test]
    fn test_config_envelope_flattens_run_config() {
        let cfg = RunConfig::default().worker(4, Role::Producer);
        let line = serde_json::to_string(&ToWorker::Config(Box::new(cfg.clone()))).unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["channel"], "config");
        assert_eq!(value["message"]["alias"], "pub-4");
        assert_eq!(value["message"]["port"], 4150);

        match decode::<ToWorker>(&line).unwrap() {
            Incoming::Known(ToWorker::Config(back)) => assert_eq!(*back, cfg),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unknown_channel_is_not_an_error() {
        let got = decode::<ToWorker>(r#"{"channel":"reboot","message":{"now":true}}"#).unwrap();
        assert_eq!(
            got,
            Incoming::Unknown {
                channel: "reboot".into(),
                message: json!({"now": true}),
            }
        );
    }

    #[test]
    fn test_known_channel_with_bad_payload_is_malformed() {
        let err = decode::<ToSupervisor>(r#"{"channel":"report","message":{"role":"x"}}"#)
            .unwrap_err();
        assert_eq!(err.as_label(), "protocol_malformed");

        let err = decode::<ToSupervisor>("not json").unwrap_err();
        assert_eq!(err.as_label(), "protocol_malformed");
    }

    #[test]
    fn test_sample_take_resets() {
        let mut sample = ReportSample::Consumer {
            received: 3,
            retried: 1,
        };
        let taken = sample.take();
        assert_eq!(
            taken,
            ReportSample::Consumer {
                received: 3,
                retried: 1
            }
        );
        assert!(sample.is_zero());
        assert_eq!(sample.role(), Role::Consumer);
    }
}
