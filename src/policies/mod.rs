//! Reconnection delay policies.
//!
//! The bus backends retry lost broker connections; these knobs decide
//! **how long** to wait between attempts.
//!
//! ## Contents
//! - [`BackoffPolicy`] how reconnect delays evolve (first / factor / max + jitter)
//! - [`JitterPolicy`]  randomization so that many workers do not redial in lockstep
//!
//! ## Quick wiring
//! ```text
//! RunConfig { reconnect_delay_ms, max_reconnect_delay_ms, max_reconnect_attempts }
//!      └─► RunConfig::reconnect_backoff() ─► BackoffPolicy { factor: 2.0, jitter: Equal }
//!           └─► bus::nsq reconnect loop: sleep(backoff.next(attempt)) between dials
//! ```

mod backoff;
mod jitter;

pub use backoff::BackoffPolicy;
pub use jitter::JitterPolicy;
