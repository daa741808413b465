//! Graceful shutdown coordination using cancellation tokens.
//!
//! One controller is created per run and wired to SIGINT/SIGTERM; every
//! subsystem gets a child token, so cancellation propagates from the top
//! down through RPCs, chunk workers, tickers, and sleeps.

use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct ShutdownController {
    token: CancellationToken,
}

impl ShutdownController {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Spawn a task that cancels the root token on SIGINT or SIGTERM.
    pub fn listen_for_signals(&self) {
        let token = self.token.clone();
        tokio::spawn(async move {
            let interrupted = wait_for_signal().await;
            if interrupted {
                log::info!("interrupt received, shutting down...");
            }
            token.cancel();
        });
    }

    /// Trigger shutdown, notifying all waiting tasks.
    pub fn trigger(&self) {
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes when shutdown is triggered; use in `tokio::select!`.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Child token cancelled with the controller but also independently
    /// cancellable.
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> bool {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            log::error!("failed to install SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return true;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => true,
        _ = term.recv() => true,
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> bool {
    let _ = tokio::signal::ctrl_c().await;
    true
}
