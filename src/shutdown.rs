//! Graceful shutdown helpers.
//!
//! [`shutdown_signal`] waits for `Ctrl+C` or `SIGTERM` on Unix.
//! [`cancel_on_signal`] turns that signal into a cancelled
//! [`CancellationToken`] so in-flight streams can stop cleanly.

use tokio_util::sync::CancellationToken;

/// Waits for either `Ctrl+C` or `SIGTERM` (on Unix) to be received.
pub async fn shutdown_signal() {
    tracing::debug!("awaiting shutdown signal");
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable, waiting for Ctrl+C");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    tracing::debug!("shutdown signal received");
}

/// Waits for a shutdown signal and cancels `token`.
pub async fn cancel_on_signal(token: CancellationToken) {
    shutdown_signal().await;
    tracing::info!("shutting down, cancelling active streams");
    token.cancel();
}
