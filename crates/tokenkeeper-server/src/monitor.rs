//! Background loop that re-runs the credential check on a fixed interval.
//!
//! There is no backoff and no jitter: a failed cycle is retried on the next
//! tick. The sleep is a `select!` over the timer, the command channel and a
//! cancellation token, so [`MonitorHandle::stop`] and cancellation both take
//! effect immediately.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ServerError, ServerResult};

/// Why a cycle runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleKind {
    /// Regular check; reauthorize only when needed.
    Check,
    /// Reauthorize regardless of the expiry check.
    Force,
}

/// Commands that can be sent to the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorCommand {
    CheckNow,
    ForceRefresh,
    Stop,
}

/// Snapshot of the monitor for status reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorState {
    pub running: bool,
    pub last_check: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    /// Expiry of the credential after the last successful cycle.
    pub expiry: Option<DateTime<Utc>>,
}

impl MonitorState {
    pub fn record_success(&mut self, expiry: Option<DateTime<Utc>>) {
        let now = Utc::now();
        self.last_check = Some(now);
        self.last_success = Some(now);
        self.consecutive_failures = 0;
        self.last_error = None;
        self.expiry = expiry;
    }

    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.last_check = Some(Utc::now());
        self.consecutive_failures += 1;
        self.last_error = Some(error.into());
    }
}

/// Shared monitor state.
pub type SharedMonitorState = Arc<RwLock<MonitorState>>;

/// The monitor loop.
pub struct Monitor {
    interval: Duration,
    state: SharedMonitorState,
    command_tx: mpsc::Sender<MonitorCommand>,
    command_rx: mpsc::Receiver<MonitorCommand>,
}

impl Monitor {
    pub fn new(interval: Duration) -> Self {
        let (command_tx, command_rx) = mpsc::channel(16);
        Self {
            interval,
            state: Arc::new(RwLock::new(MonitorState::default())),
            command_tx,
            command_rx,
        }
    }

    /// Returns a handle for sending commands to the loop.
    pub fn handle(&self) -> MonitorHandle {
        MonitorHandle {
            command_tx: self.command_tx.clone(),
            state: self.state.clone(),
        }
    }

    /// Runs until stopped or cancelled.
    ///
    /// The first cycle runs immediately. A cycle returns the credential
    /// expiry on success, or a description of what went wrong.
    pub async fn run<F, Fut>(self, cancel: CancellationToken, cycle: F)
    where
        F: Fn(CycleKind) -> Fut + Send + Sync,
        Fut: Future<Output = Result<Option<DateTime<Utc>>, String>> + Send,
    {
        let Monitor {
            interval,
            state,
            command_tx,
            mut command_rx,
        } = self;
        // Keep the channel open even when every handle is dropped.
        let _command_tx = command_tx;

        state.write().await.running = true;
        info!(interval_secs = interval.as_secs(), "monitor started");

        let mut next = CycleKind::Check;
        loop {
            if !run_cycle(&state, &cancel, &cycle, next).await {
                break;
            }

            debug!(delay_secs = interval.as_secs(), "next check scheduled");
            next = tokio::select! {
                _ = tokio::time::sleep(interval) => CycleKind::Check,
                _ = cancel.cancelled() => break,
                cmd = command_rx.recv() => match cmd {
                    Some(MonitorCommand::CheckNow) => CycleKind::Check,
                    Some(MonitorCommand::ForceRefresh) => CycleKind::Force,
                    Some(MonitorCommand::Stop) | None => break,
                },
            };
        }

        state.write().await.running = false;
        info!("monitor stopped");
    }
}

/// Runs one cycle. Returns false if the monitor was cancelled meanwhile.
async fn run_cycle<F, Fut>(
    state: &SharedMonitorState,
    cancel: &CancellationToken,
    cycle: &F,
    kind: CycleKind,
) -> bool
where
    F: Fn(CycleKind) -> Fut,
    Fut: Future<Output = Result<Option<DateTime<Utc>>, String>>,
{
    debug!(?kind, "running credential check");
    let result = tokio::select! {
        result = cycle(kind) => result,
        _ = cancel.cancelled() => return false,
    };

    match result {
        Ok(expiry) => {
            debug!(?expiry, "credential check succeeded");
            state.write().await.record_success(expiry);
        }
        Err(e) => {
            warn!(error = %e, "credential check failed, retrying next cycle");
            state.write().await.record_failure(e);
        }
    }
    !cancel.is_cancelled()
}

/// Handle for a running monitor.
#[derive(Clone, Debug)]
pub struct MonitorHandle {
    command_tx: mpsc::Sender<MonitorCommand>,
    state: SharedMonitorState,
}

impl MonitorHandle {
    async fn send(&self, command: MonitorCommand) -> ServerResult<()> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| ServerError::MonitorStopped)
    }

    /// Runs a check cycle without waiting for the interval.
    pub async fn check_now(&self) -> ServerResult<()> {
        self.send(MonitorCommand::CheckNow).await
    }

    /// Runs a forced reauthorization cycle.
    pub async fn force_refresh(&self) -> ServerResult<()> {
        self.send(MonitorCommand::ForceRefresh).await
    }

    /// Asks the loop to exit after the current cycle.
    pub async fn stop(&self) -> ServerResult<()> {
        self.send(MonitorCommand::Stop).await
    }

    /// Returns a snapshot of the monitor state.
    pub async fn state(&self) -> MonitorState {
        self.state.read().await.clone()
    }
}
