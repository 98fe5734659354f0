//! Supervisor/worker envelopes and the channel that carries them.
//!
//! Every message in either direction is one JSON object per line:
//! `{"channel": "<tag>", "message": <payload>}`.
//!
//! ## Contents
//! - [`ToSupervisor`], [`ToWorker`] tagged unions of the recognized channels
//! - [`ReportSample`] role-tagged counters carried by `report`
//! - [`EnvelopeStream`], [`EnvelopeSink`] line-framed codec over any async pipe
//!
//! ## Tags
//! ```text
//! worker ──► supervisor : started | ready | report | error | ended
//! supervisor ──► worker : config | run | halt
//! ```
//! Any other tag decodes to [`Incoming::Unknown`]; both sides log it and move on.

mod channel;
mod envelope;

pub use channel::{EnvelopeSink, EnvelopeStream, MAX_LINE_BYTES};
pub use envelope::{Envelope, Failure, Incoming, ReportSample, ToSupervisor, ToWorker, decode};
