//! Check-and-reauthorize sequencing.
//!
//! Callers that need API access ask [`Orchestrator::get_valid_credentials`].
//! `None` means "temporarily unavailable, retry later"; nothing in here ends
//! the process.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokenkeeper_oauth::{
    AuthError, CallbackConfig, CallbackServer, Credential, ExpirationStatus, RefreshEngine,
};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::monitor::{CycleKind, Monitor, MonitorHandle, MonitorState};
use crate::notify::NotificationDispatcher;

/// How long `stop_monitoring` waits for the loop before aborting it.
const MONITOR_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Timing of the check-and-reauthorize sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Refresh when the credential expires within this window.
    pub refresh_buffer: Duration,
    /// Delay between monitor cycles.
    pub check_interval: Duration,
    /// How long to wait for a human to complete authorization.
    pub auth_timeout: Duration,
    /// Send a confirmation after a completed reauthorization.
    pub notify_on_success: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            refresh_buffer: Duration::from_secs(300),
            check_interval: Duration::from_secs(3600),
            auth_timeout: Duration::from_secs(600),
            notify_on_success: true,
        }
    }
}

impl OrchestratorConfig {
    pub fn with_refresh_buffer(mut self, buffer: Duration) -> Self {
        self.refresh_buffer = buffer;
        self
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn with_auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = timeout;
        self
    }

    pub fn with_notify_on_success(mut self, notify: bool) -> Self {
        self.notify_on_success = notify;
        self
    }

    /// Refresh buffer for expiry checks, saturating at a year.
    pub fn buffer(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.refresh_buffer)
            .unwrap_or_else(|_| chrono::Duration::days(365))
    }
}

enum SilentRefresh {
    Refreshed(Credential),
    /// Network trouble; try again next cycle without paging anyone.
    Transient,
    /// A human has to authorize again.
    NeedsReauth(&'static str),
}

struct MonitorTask {
    handle: MonitorHandle,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Inner {
    config: OrchestratorConfig,
    engine: Arc<RefreshEngine>,
    server: CallbackServer,
    dispatcher: NotificationDispatcher,
    reauth_lock: AsyncMutex<()>,
    shutdown: CancellationToken,
    monitor: Mutex<Option<MonitorTask>>,
}

/// Aborts the callback server if a sequence is dropped mid-flight.
struct AbortOnDrop<'a>(&'a CallbackServer);

impl Drop for AbortOnDrop<'_> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Owns the refresh engine, the callback server and the dispatcher.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.inner.config)
            .field("engine", &self.inner.engine)
            .field("dispatcher", &self.inner.dispatcher)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        engine: Arc<RefreshEngine>,
        callback: CallbackConfig,
        dispatcher: NotificationDispatcher,
    ) -> Self {
        let server = CallbackServer::new(callback, engine.clone());
        let dispatcher = dispatcher.with_link_validity(config.auth_timeout);
        Self {
            inner: Arc::new(Inner {
                config,
                engine,
                server,
                dispatcher,
                reauth_lock: AsyncMutex::new(()),
                shutdown: CancellationToken::new(),
                monitor: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn engine(&self) -> &Arc<RefreshEngine> {
        &self.inner.engine
    }

    pub fn callback_server(&self) -> &CallbackServer {
        &self.inner.server
    }

    /// Runs the expiry check without touching the network.
    pub async fn check_expiration(&self) -> ExpirationStatus {
        self.inner
            .engine
            .check_token_expiration(self.inner.config.buffer())
            .await
    }

    /// Returns a usable credential, reauthorizing interactively if needed.
    ///
    /// Blocks for up to the auth timeout while waiting for a human.
    pub async fn get_valid_credentials(&self) -> Option<Credential> {
        self.valid_credentials(&self.inner.shutdown).await
    }

    /// Runs the interactive sequence regardless of the expiry check.
    pub async fn force_refresh(&self) -> Option<Credential> {
        self.reauthorize(&self.inner.shutdown, "manual refresh requested", true)
            .await
    }

    /// Cancels every in-flight sequence, including the monitor's.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    async fn valid_credentials(&self, cancel: &CancellationToken) -> Option<Credential> {
        let engine = &self.inner.engine;
        let status = engine
            .check_token_expiration(self.inner.config.buffer())
            .await;

        if !status.needs_refresh
            && let Some(credential) = engine.get_credentials().await
        {
            debug!(expiry = ?credential.expiry, "credential is valid");
            return Some(credential);
        }

        match self.silent_refresh().await {
            SilentRefresh::Refreshed(credential) => Some(credential),
            SilentRefresh::Transient => None,
            SilentRefresh::NeedsReauth(reason) => self.reauthorize(cancel, reason, false).await,
        }
    }

    async fn silent_refresh(&self) -> SilentRefresh {
        let engine = &self.inner.engine;
        match engine.store().load() {
            Ok(credential) if credential.can_refresh() => {}
            Ok(_) => return SilentRefresh::NeedsReauth("credential cannot be refreshed"),
            Err(_) => return SilentRefresh::NeedsReauth("no stored credential"),
        }

        match engine.refresh_credentials().await {
            Ok(credential) => {
                info!(expiry = ?credential.expiry, "credential refreshed silently");
                SilentRefresh::Refreshed(credential)
            }
            Err(e) if e.requires_reauth() => {
                warn!(error = %e, "silent refresh rejected, reauthorization required");
                SilentRefresh::NeedsReauth("refresh token was rejected")
            }
            Err(e) => {
                warn!(error = %e, "silent refresh failed, will retry next cycle");
                SilentRefresh::Transient
            }
        }
    }

    async fn reauthorize(
        &self,
        cancel: &CancellationToken,
        reason: &str,
        forced: bool,
    ) -> Option<Credential> {
        let _guard = self.inner.reauth_lock.lock().await;
        let engine = &self.inner.engine;

        // Another sequence may have finished while we waited for the lock.
        if !forced
            && !self.check_expiration().await.needs_refresh
            && let Some(credential) = engine.get_credentials().await
        {
            return Some(credential);
        }

        if cancel.is_cancelled() {
            return None;
        }

        let server = &self.inner.server;
        let url = match server.start().await {
            Ok(url) => url,
            Err(e) => {
                error!(error = %e, "failed to start callback server");
                return None;
            }
        };
        let _abort = AbortOnDrop(server);

        info!(reason, "waiting for interactive authorization");
        let success = self.await_authorization(&url, reason, cancel).await;
        server.stop().await;

        if !success {
            return None;
        }

        let credential = engine.get_credentials().await;
        if credential.is_some() && self.inner.config.notify_on_success {
            self.inner.dispatcher.send_success_notification().await;
        }
        credential
    }

    async fn await_authorization(
        &self,
        url: &str,
        reason: &str,
        cancel: &CancellationToken,
    ) -> bool {
        let server = &self.inner.server;
        let timeout = self.inner.config.auth_timeout;

        self.inner
            .dispatcher
            .send_auth_notification(url, Some(reason))
            .await;

        let success = tokio::select! {
            success = server.wait_for_auth(timeout) => success,
            _ = cancel.cancelled() => {
                info!("authorization wait cancelled");
                return false;
            }
        };

        if !success {
            let completed = server.session().is_some_and(|s| s.is_completed());
            if completed {
                error!("authorization callback failed");
            } else {
                let err = AuthError::timeout(format!(
                    "no authorization received within {}s",
                    timeout.as_secs()
                ));
                error!(
                    error = %err,
                    retryable = err.is_retryable(),
                    "authorization timed out, retrying next cycle"
                );
            }
        }
        success
    }

    async fn cycle(
        &self,
        kind: CycleKind,
        cancel: &CancellationToken,
    ) -> Result<Option<DateTime<Utc>>, String> {
        let credential = match kind {
            CycleKind::Check => self.valid_credentials(cancel).await,
            CycleKind::Force => {
                self.reauthorize(cancel, "forced refresh requested", true)
                    .await
            }
        };
        match credential {
            Some(credential) => Ok(credential.expiry),
            None => Err("no valid credential available".to_string()),
        }
    }

    /// Starts the background monitor, or returns the running one.
    pub fn start_monitoring(&self) -> MonitorHandle {
        let mut slot = self
            .inner
            .monitor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(running) = slot.as_ref()
            && !running.task.is_finished()
        {
            return running.handle.clone();
        }

        let monitor = Monitor::new(self.inner.config.check_interval);
        let handle = monitor.handle();
        let cancel = self.inner.shutdown.child_token();

        let task = tokio::spawn({
            let this = self.clone();
            let cancel = cancel.clone();
            async move {
                let cycle_cancel = cancel.clone();
                monitor
                    .run(cancel, move |kind| {
                        let this = this.clone();
                        let cancel = cycle_cancel.clone();
                        async move { this.cycle(kind, &cancel).await }
                    })
                    .await;
            }
        });

        *slot = Some(MonitorTask {
            handle: handle.clone(),
            cancel,
            task,
        });
        handle
    }

    /// Stops the monitor, cancelling any authorization it is waiting on.
    ///
    /// A foreground sequence holding the callback server is left running.
    pub async fn stop_monitoring(&self) {
        let running = self
            .inner
            .monitor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(MonitorTask {
            cancel, mut task, ..
        }) = running
        else {
            return;
        };

        cancel.cancel();
        if tokio::time::timeout(MONITOR_STOP_TIMEOUT, &mut task)
            .await
            .is_err()
        {
            warn!("monitor did not stop in time, aborting");
            task.abort();
        }
    }

    /// Returns the running monitor's handle.
    pub fn monitor(&self) -> Option<MonitorHandle> {
        self.inner
            .monitor
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(|m| m.handle.clone()))
    }

    /// Snapshot of the monitor; all defaults when it never ran.
    pub async fn state(&self) -> MonitorState {
        match self.monitor() {
            Some(handle) => handle.state().await,
            None => MonitorState::default(),
        }
    }
}
