//! Unix signal handling for the daemon.
//!
//! - SIGTERM/SIGINT: graceful shutdown
//! - SIGHUP: run a credential check now

use std::sync::Arc;

use tokio::sync::{Notify, watch};
use tracing::{debug, error, info};

/// Turns process signals into shutdown and check requests.
pub struct SignalHandler {
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
    check: Arc<Notify>,
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalHandler {
    pub fn new() -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
            check: Arc::new(Notify::new()),
        }
    }

    /// Spawns the signal listener task. Call once at startup.
    #[cfg(unix)]
    pub fn spawn_listener(&self) {
        use tokio::signal::unix::{SignalKind, signal};

        let shutdown_tx = self.shutdown_tx.clone();
        let check = self.check.clone();

        tokio::spawn(async move {
            let (mut sigterm, mut sigint, mut sighup) = match (
                signal(SignalKind::terminate()),
                signal(SignalKind::interrupt()),
                signal(SignalKind::hangup()),
            ) {
                (Ok(term), Ok(int), Ok(hup)) => (term, int, hup),
                (term, int, hup) => {
                    let err = [term.err(), int.err(), hup.err()].into_iter().flatten().next();
                    error!(error = ?err, "failed to install signal handlers");
                    return;
                }
            };

            loop {
                tokio::select! {
                    _ = sigterm.recv() => {
                        info!("received SIGTERM, shutting down");
                        let _ = shutdown_tx.send(true);
                        break;
                    }
                    _ = sigint.recv() => {
                        info!("received SIGINT, shutting down");
                        let _ = shutdown_tx.send(true);
                        break;
                    }
                    _ = sighup.recv() => {
                        info!("received SIGHUP, checking credential now");
                        check.notify_one();
                    }
                }
            }

            debug!("signal listener stopped");
        });
    }

    /// Only Ctrl+C is handled off Unix.
    #[cfg(not(unix))]
    pub fn spawn_listener(&self) {
        let shutdown_tx = self.shutdown_tx.clone();

        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                info!("received Ctrl+C, shutting down");
                let _ = shutdown_tx.send(true);
            }
        });
    }

    /// Completes when shutdown is requested.
    pub async fn shutdown(&self) {
        let mut rx = self.shutdown_rx.clone();
        // An error means every sender is gone, which only happens on drop.
        let _ = rx.wait_for(|requested| *requested).await;
    }

    /// Completes on the next check request.
    pub async fn check_requested(&self) {
        self.check.notified().await;
    }

}

#[cfg(test)]
impl SignalHandler {
    fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    fn trigger_check(&self) {
        self.check.notify_one();
    }
}
