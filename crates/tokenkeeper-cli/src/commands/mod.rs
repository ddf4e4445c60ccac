//! Subcommand implementations.

pub mod check;
pub mod config;
pub mod refresh;
pub mod run;
pub mod status;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokenkeeper_oauth::{Credential, RefreshEngine};
use tokenkeeper_server::{NotificationDispatcher, Orchestrator, SignalHandler};

use crate::config::AppConfig;
use crate::error::{ClientError, ClientResult};

/// Builds the orchestrator and everything it owns from the config file.
///
/// Fails on any configuration problem, before anything is bound or sent.
pub fn build_orchestrator(config: &AppConfig) -> ClientResult<Orchestrator> {
    let oauth = config.oauth.to_oauth_config().map_err(ClientError::Config)?;
    let engine = Arc::new(RefreshEngine::from_config(oauth)?);

    let notification = config
        .notifications
        .to_notification_config()
        .map_err(ClientError::Config)?;
    let mut dispatcher = NotificationDispatcher::from_config(&notification)?;
    if let Some(service) = &config.notifications.service_name {
        dispatcher = dispatcher.with_service(service.clone());
    }

    let orchestrator_config = config
        .monitor
        .to_orchestrator_config()
        .map_err(ClientError::Config)?;

    Ok(Orchestrator::new(
        orchestrator_config,
        engine,
        config.callback.to_callback_config(),
        dispatcher,
    ))
}

/// Cancels the orchestrator's in-flight work on SIGTERM or SIGINT.
fn cancel_on_signal(orchestrator: &Orchestrator) {
    let signals = SignalHandler::new();
    signals.spawn_listener();
    let orchestrator = orchestrator.clone();
    tokio::spawn(async move {
        signals.shutdown().await;
        orchestrator.shutdown();
    });
}

/// What `check` and `refresh` print. Never contains token material.
#[derive(Debug, Serialize)]
pub struct CredentialSummary {
    pub valid: bool,
    pub token_path: PathBuf,
    pub expiry: Option<DateTime<Utc>>,
    pub expires_in_secs: Option<i64>,
    pub scopes: Vec<String>,
    pub refreshable: bool,
}

impl CredentialSummary {
    pub fn new(credential: Option<&Credential>, token_path: PathBuf) -> Self {
        match credential {
            Some(credential) => Self {
                valid: true,
                token_path,
                expiry: credential.expiry,
                expires_in_secs: credential.time_until_expiry().map(|d| d.num_seconds()),
                scopes: credential.scopes.clone(),
                refreshable: credential.can_refresh(),
            },
            None => Self {
                valid: false,
                token_path,
                expiry: None,
                expires_in_secs: None,
                scopes: Vec::new(),
                refreshable: false,
            },
        }
    }

    fn print(&self, json: bool) -> ClientResult<()> {
        if json {
            let out = serde_json::to_string_pretty(self)
                .map_err(|e| ClientError::Auth(format!("failed to serialize result: {}", e)))?;
            println!("{}", out);
            return Ok(());
        }

        if !self.valid {
            println!("No valid credential");
            return Ok(());
        }
        println!("Credential is valid");
        println!("  token:   {}", self.token_path.display());
        match (self.expiry, self.expires_in_secs) {
            (Some(expiry), Some(secs)) => {
                println!("  expires: {} (in {})", expiry.to_rfc3339(), format_secs(secs));
            }
            _ => println!("  expires: unknown"),
        }
        println!("  scopes:  {}", self.scopes.join(" "));
        Ok(())
    }
}

/// Formats a duration in seconds as `1h 05m` or `4m 10s`.
pub fn format_secs(secs: i64) -> String {
    if secs < 0 {
        return format!("expired {} ago", format_secs(-secs));
    }
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{}h {:02}m", h, m)
    } else if m > 0 {
        format!("{}m {:02}s", m, s)
    } else {
        format!("{}s", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokenkeeper_oauth::ClientSecrets;

    fn config_in(dir: &std::path::Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.oauth.client_id = Some("id.apps.example.com".to_string());
        config.oauth.client_secret = Some("secret".to_string());
        config.oauth.token_path = Some(dir.join("token.json"));
        config
    }

    #[test]
    fn formats_durations() {
        assert_eq!(format_secs(42), "42s");
        assert_eq!(format_secs(250), "4m 10s");
        assert_eq!(format_secs(3900), "1h 05m");
        assert_eq!(format_secs(-90), "expired 1m 30s ago");
    }

    #[test]
    fn summary_never_leaks_tokens() {
        let secrets = ClientSecrets::new("id", "client-secret-value");
        let credential = Credential::new(
            "access-token-value",
            Some("refresh-token-value".to_string()),
            Some(3600),
            vec!["scope-a".to_string()],
            &secrets,
        );
        let summary = CredentialSummary::new(Some(&credential), PathBuf::from("/tmp/token.json"));
        let json = serde_json::to_string(&summary).unwrap();
        assert!(json.contains("\"valid\":true"));
        assert!(json.contains("\"refreshable\":true"));
        assert!(!json.contains("access-token-value"));
        assert!(!json.contains("refresh-token-value"));
        assert!(!json.contains("client-secret-value"));

        let missing = CredentialSummary::new(None, PathBuf::from("/tmp/token.json"));
        assert!(!missing.valid);
        assert!(missing.expiry.is_none());
    }

    #[tokio::test]
    async fn builds_orchestrator_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.monitor.interval_secs = 120;

        let orchestrator = build_orchestrator(&config).unwrap();
        assert_eq!(orchestrator.config().check_interval.as_secs(), 120);
        assert_eq!(
            orchestrator.engine().store().path(),
            dir.path().join("token.json")
        );
    }

    #[test]
    fn configuration_errors_are_reported_before_startup() {
        let err = build_orchestrator(&AppConfig::default()).unwrap_err();
        assert!(matches!(err, ClientError::Config(_)));

        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.notifications.method = crate::config::NotificationMethod::Email;
        let err = build_orchestrator(&config).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }
}
