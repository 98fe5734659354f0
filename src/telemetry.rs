//! # Log output.
//!
//! Every process (supervisor and workers) logs to **stderr**. A worker's
//! stdout carries the envelope channel and must never see a log line.
//!
//! The filter comes from `RUST_LOG`; unset or invalid falls back to `info`.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Installs the global `tracing` subscriber.
///
/// Calling it twice is harmless: the second installation is refused and ignored.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init();
}
