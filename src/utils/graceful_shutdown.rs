use std::time::Duration;

use tokio::{signal, task::JoinHandle, time::timeout};
use tokio_util::sync::CancellationToken;

/// Coordinates shutdown: OS signals cancel a shared token that the server
/// and background tasks watch, then background tasks get a bounded time to
/// finish.
pub struct GracefulShutdown {
    token: CancellationToken,
    /// Maximum time to wait for background tasks once shutdown started
    shutdown_timeout: Duration,
}

impl GracefulShutdown {
    /// Create a new GracefulShutdown manager with default 30-second timeout
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(shutdown_timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            shutdown_timeout,
        }
    }

    /// Token cancelled when shutdown starts.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_shutdown_initiated(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Manually trigger shutdown
    pub fn trigger_shutdown(&self) {
        if !self.token.is_cancelled() {
            tracing::info!("Shutdown manually triggered");
            self.token.cancel();
        }
    }

    /// Wait for SIGINT or SIGTERM, then start shutdown.
    pub async fn run_signal_handler(&self) {
        tracing::info!("Signal handler started. Listening for SIGTERM and SIGINT");

        tokio::select! {
            result = signal::ctrl_c() => {
                match result {
                    Ok(()) => tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown..."),
                    Err(e) => tracing::error!("Failed to listen for Ctrl+C: {}", e),
                }
            }
            _ = Self::wait_for_sigterm() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown...");
            }
            _ = self.token.cancelled() => return,
        }
        self.token.cancel();
    }

    #[cfg(unix)]
    async fn wait_for_sigterm() {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to register SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    }

    #[cfg(not(unix))]
    async fn wait_for_sigterm() {
        // On non-Unix systems, we only have Ctrl+C
        std::future::pending::<()>().await;
    }

    /// Wait until shutdown starts.
    pub async fn wait_for_shutdown_signal(&self) {
        self.token.cancelled().await;
    }

    /// Wait for `tasks` to finish, aborting whatever is still running when
    /// the shutdown timeout expires. Returns `false` on timeout.
    pub async fn drain(&self, tasks: Vec<JoinHandle<()>>) -> bool {
        let aborts: Vec<_> = tasks.iter().map(JoinHandle::abort_handle).collect();
        let all = async {
            for task in tasks {
                let _ = task.await;
            }
        };
        match timeout(self.shutdown_timeout, all).await {
            Ok(()) => true,
            Err(_) => {
                tracing::error!(
                    "Shutdown timeout exceeded ({:?}), aborting remaining tasks",
                    self.shutdown_timeout
                );
                for abort in aborts {
                    abort.abort();
                }
                false
            }
        }
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}
