//! # Operator stop signal.
//!
//! [`wait_for_shutdown_signal`] completes when the operator asks the run to
//! stop. The supervisor turns that into a halt cascade; nothing is killed.
//!
//! ## Signals
//! **Unix:** `SIGINT` (Ctrl-C), `SIGTERM`, `SIGQUIT`.
//!
//! **Elsewhere:** Ctrl-C via [`tokio::signal::ctrl_c`].
//!
//! Workers share the supervisor's process group, so a terminal Ctrl-C reaches
//! them too. They ignore it and wait for `halt` on their control channel.

/// Waits for a stop signal; `Err` if the handlers cannot be registered.
#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = sigint.recv()  => {},
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
    }
    Ok(())
}

/// Waits for a stop signal; `Err` if the handler cannot be registered.
#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

/// Keeps terminal interrupts from killing a worker process.
///
/// Registering a handler replaces the default "terminate" disposition; the
/// listener task just drains the notifications.
#[cfg(unix)]
pub fn ignore_interrupts() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::spawn(async move {
        while sigint.recv().await.is_some() {
            tracing::debug!("interrupt ignored; waiting for halt");
        }
    });
    Ok(())
}

/// Keeps terminal interrupts from killing a worker process.
#[cfg(not(unix))]
pub fn ignore_interrupts() -> std::io::Result<()> {
    tokio::spawn(async {
        while tokio::signal::ctrl_c().await.is_ok() {
            tracing::debug!("interrupt ignored; waiting for halt");
        }
    });
    Ok(())
}
