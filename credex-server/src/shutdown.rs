//! Graceful shutdown on SIGTERM / SIGINT (Ctrl+C elsewhere).

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Cancels a token when the process is asked to stop.
///
/// The token can be handed to `axum::serve(..).with_graceful_shutdown` and to
/// any other subsystem that must drain before exit.
#[allow(missing_debug_implementations)] // TaskTracker doesn't impl Debug
pub struct Shutdown {
    tracker: TaskTracker,
    token: CancellationToken,
}

impl Shutdown {
    /// Installs the signal listeners.
    ///
    /// # Errors
    ///
    /// Returns [`std::io::Error`] if a signal handler cannot be registered.
    #[allow(clippy::unnecessary_wraps)] // only fallible on Unix
    pub fn install() -> Result<Self, std::io::Error> {
        let token = CancellationToken::new();
        let tracker = TaskTracker::new();
        let trigger = token.clone();

        #[cfg(unix)]
        {
            let mut sigterm = signal(SignalKind::terminate())?;
            let mut sigint = signal(SignalKind::interrupt())?;
            tracker.spawn(async move {
                let name = tokio::select! {
                    _ = sigterm.recv() => "SIGTERM",
                    _ = sigint.recv() => "SIGINT",
                };
                tracing::info!(signal = name, "shutting down");
                trigger.cancel();
            });
        }

        #[cfg(not(unix))]
        tracker.spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!(signal = "ctrl-c", "shutting down");
            trigger.cancel();
        });

        tracker.close();
        Ok(Self { tracker, token })
    }

    /// A token cancelled when a shutdown signal arrives.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Waits for the listener task after cancellation.
    pub async fn finished(self) {
        self.token.cancelled().await;
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_token_is_live_until_signalled() {
        let shutdown = Shutdown::install().unwrap();
        assert!(!shutdown.token().is_cancelled());
    }
}
