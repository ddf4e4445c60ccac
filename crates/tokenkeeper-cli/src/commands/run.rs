//! `tokenkeeper run`: the foreground daemon.

use tokenkeeper_server::SignalHandler;
use tracing::{info, warn};

use super::build_orchestrator;
use crate::config::AppConfig;
use crate::error::ClientResult;

/// Runs the monitor until SIGTERM or SIGINT. SIGHUP triggers a check.
pub async fn run(config: &AppConfig) -> ClientResult<()> {
    let orchestrator = build_orchestrator(config)?;

    let signals = SignalHandler::new();
    signals.spawn_listener();

    info!(
        token_path = %orchestrator.engine().store().path().display(),
        interval_secs = orchestrator.config().check_interval.as_secs(),
        notifications = ?config.notifications.method,
        "starting tokenkeeper"
    );
    let handle = orchestrator.start_monitoring();

    loop {
        tokio::select! {
            _ = signals.shutdown() => break,
            _ = signals.check_requested() => {
                if let Err(e) = handle.check_now().await {
                    warn!(error = %e, "monitor is gone, exiting");
                    break;
                }
            }
        }
    }

    orchestrator.stop_monitoring().await;
    orchestrator.shutdown();

    let state = handle.state().await;
    info!(
        last_success = ?state.last_success,
        consecutive_failures = state.consecutive_failures,
        "tokenkeeper stopped"
    );
    Ok(())
}
