//! Daemon configuration.
//!
//! Everything lives in one `config.toml`, by default at
//! `~/.config/tokenkeeper/config.toml`:
//!
//! ```toml
//! [oauth]
//! client_secrets_file = "~/.config/tokenkeeper/client_secret.json"
//! scopes = ["https://www.googleapis.com/auth/calendar"]
//!
//! [callback]
//! host = "0.0.0.0"
//! port = 8080
//! redirect_host = "tokenkeeper.internal"
//!
//! [monitor]
//! interval_secs = 3600
//!
//! [notifications]
//! method = "slack"
//!
//! [notifications.slack]
//! webhook_url = "env::SLACK_WEBHOOK"
//! ```
//!
//! Client credentials, the SMTP password and webhook URLs accept the secret
//! references described in [`crate::secret`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokenkeeper_oauth::{CallbackConfig, ClientSecrets, OAuthConfig};
use tokenkeeper_server::{
    EmailConfig, NotificationConfig, OrchestratorConfig, SmtpSecurity, WebhookConfig,
};

use crate::secret;

/// Contents of `config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub oauth: OAuthSettings,
    pub callback: CallbackSettings,
    pub monitor: MonitorSettings,
    pub notifications: NotificationSettings,
}

/// `[oauth]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthSettings {
    /// Provider "client secrets" JSON file. Takes precedence over the inline
    /// `client_id`/`client_secret`.
    pub client_secrets_file: Option<PathBuf>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    /// Where the credential is stored. Defaults to the user data directory.
    pub token_path: Option<PathBuf>,
    pub scopes: Vec<String>,
    pub auth_uri: Option<String>,
    pub token_uri: Option<String>,
    /// Treat a credential without an expiry as due for refresh.
    pub refresh_when_expiry_unknown: bool,
    pub request_timeout_secs: u64,
}

impl Default for OAuthSettings {
    fn default() -> Self {
        Self {
            client_secrets_file: None,
            client_id: None,
            client_secret: None,
            token_path: None,
            scopes: OAuthConfig::DEFAULT_SCOPES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            auth_uri: None,
            token_uri: None,
            refresh_when_expiry_unknown: true,
            request_timeout_secs: OAuthConfig::DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl OAuthSettings {
    /// The configured token path, or the default one.
    pub fn token_path(&self) -> PathBuf {
        self.token_path
            .as_deref()
            .map(expand_home)
            .unwrap_or_else(OAuthConfig::default_token_path)
    }

    /// Loads and resolves the client secrets.
    pub fn client_secrets(&self) -> Result<ClientSecrets, String> {
        let mut secrets = if let Some(path) = &self.client_secrets_file {
            ClientSecrets::from_file(expand_home(path)).map_err(|e| e.to_string())?
        } else {
            match (&self.client_id, &self.client_secret) {
                (Some(id), Some(secret)) => {
                    let id = secret::resolve(id).map_err(|e| format!("oauth.client_id: {}", e))?;
                    let secret = secret::resolve(secret)
                        .map_err(|e| format!("oauth.client_secret: {}", e))?;
                    ClientSecrets::new(id, secret)
                }
                _ => {
                    return Err(
                        "set oauth.client_secrets_file or both oauth.client_id and oauth.client_secret"
                            .to_string(),
                    );
                }
            }
        };

        if let Some(uri) = &self.auth_uri {
            secrets = secrets.with_auth_uri(uri);
        }
        if let Some(uri) = &self.token_uri {
            secrets = secrets.with_token_uri(uri);
        }
        Ok(secrets)
    }

    /// Builds the engine configuration.
    pub fn to_oauth_config(&self) -> Result<OAuthConfig, String> {
        let config = OAuthConfig::new(self.client_secrets()?)
            .with_scopes(self.scopes.clone())
            .with_token_path(self.token_path())
            .with_timeout(Duration::from_secs(self.request_timeout_secs))
            .with_refresh_when_expiry_unknown(self.refresh_when_expiry_unknown);
        config.validate()?;
        Ok(config)
    }
}

/// `[callback]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallbackSettings {
    /// Interface the callback server binds.
    pub host: String,
    pub port: u16,
    /// Host the provider redirects the browser to, when it differs from
    /// `host`.
    pub redirect_host: Option<String>,
}

impl Default for CallbackSettings {
    fn default() -> Self {
        let defaults = CallbackConfig::default();
        Self {
            host: defaults.host,
            port: defaults.port,
            redirect_host: None,
        }
    }
}

impl CallbackSettings {
    pub fn to_callback_config(&self) -> CallbackConfig {
        let config = CallbackConfig::new(self.host.clone(), self.port);
        match &self.redirect_host {
            Some(host) => config.with_redirect_host(host.clone()),
            None => config,
        }
    }
}

/// `[monitor]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub interval_secs: u64,
    /// Refresh when the token expires within this many seconds.
    pub refresh_buffer_secs: u64,
    /// How long an authorization link stays open.
    pub auth_timeout_secs: u64,
    pub notify_on_success: bool,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        let defaults = OrchestratorConfig::default();
        Self {
            interval_secs: defaults.check_interval.as_secs(),
            refresh_buffer_secs: defaults.refresh_buffer.as_secs(),
            auth_timeout_secs: defaults.auth_timeout.as_secs(),
            notify_on_success: defaults.notify_on_success,
        }
    }
}

impl MonitorSettings {
    /// The buffer the daemon applies, without validating the other fields.
    pub fn refresh_buffer(&self) -> chrono::Duration {
        OrchestratorConfig::default()
            .with_refresh_buffer(Duration::from_secs(self.refresh_buffer_secs))
            .buffer()
    }

    pub fn to_orchestrator_config(&self) -> Result<OrchestratorConfig, String> {
        if self.interval_secs == 0 {
            return Err("monitor.interval_secs must be greater than zero".to_string());
        }
        if self.auth_timeout_secs == 0 {
            return Err("monitor.auth_timeout_secs must be greater than zero".to_string());
        }
        Ok(OrchestratorConfig::default()
            .with_check_interval(Duration::from_secs(self.interval_secs))
            .with_refresh_buffer(Duration::from_secs(self.refresh_buffer_secs))
            .with_auth_timeout(Duration::from_secs(self.auth_timeout_secs))
            .with_notify_on_success(self.notify_on_success))
    }
}

/// Configured delivery method.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationMethod {
    #[default]
    Log,
    Email,
    Slack,
    Discord,
}

/// `[notifications]`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationSettings {
    pub method: NotificationMethod,
    /// Name of the protected service, used in messages.
    pub service_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<EmailSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slack: Option<WebhookSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discord: Option<WebhookSettings>,
}

/// `[notifications.email]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailSettings {
    pub smtp_host: String,
    #[serde(default)]
    pub smtp_port: Option<u16>,
    /// `starttls`, `tls` or `plain`.
    #[serde(default = "default_security")]
    pub security: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    pub from: String,
    pub to: Vec<String>,
}

fn default_security() -> String {
    "starttls".to_string()
}

/// `[notifications.slack]` and `[notifications.discord]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSettings {
    pub webhook_url: String,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl WebhookSettings {
    fn to_webhook_config(&self, section: &str) -> Result<WebhookConfig, String> {
        let url = secret::resolve(&self.webhook_url)
            .map_err(|e| format!("notifications.{}.webhook_url: {}", section, e))?;
        let config = WebhookConfig::new(url);
        Ok(match self.timeout_secs {
            Some(secs) => config.with_timeout(Duration::from_secs(secs)),
            None => config,
        })
    }
}

impl EmailSettings {
    fn to_email_config(&self) -> Result<EmailConfig, String> {
        let security: SmtpSecurity = self
            .security
            .parse()
            .map_err(|e| format!("notifications.email.security: {}", e))?;
        let mut config =
            EmailConfig::new(self.smtp_host.clone(), self.from.clone(), self.to.clone())
                .with_security(security);
        if let Some(port) = self.smtp_port {
            config = config.with_port(port);
        }
        match (&self.username, &self.password) {
            (Some(user), Some(password)) => {
                let password = secret::resolve(password)
                    .map_err(|e| format!("notifications.email.password: {}", e))?;
                config = config.with_credentials(user.clone(), password);
            }
            (None, None) => {}
            _ => {
                return Err(
                    "notifications.email needs both username and password, or neither".to_string(),
                );
            }
        }
        Ok(config)
    }
}

impl NotificationSettings {
    /// Resolves the configured channel.
    ///
    /// Selecting a method without its subtable is an error rather than a
    /// silent fallback to the log.
    pub fn to_notification_config(&self) -> Result<NotificationConfig, String> {
        fn section<'a, T>(value: &'a Option<T>, name: &str) -> Result<&'a T, String> {
            value
                .as_ref()
                .ok_or_else(|| format!("notifications.method is \"{0}\" but [notifications.{0}] is missing", name))
        }

        Ok(match self.method {
            NotificationMethod::Log => NotificationConfig::Log,
            NotificationMethod::Email => {
                NotificationConfig::Email(section(&self.email, "email")?.to_email_config()?)
            }
            NotificationMethod::Slack => NotificationConfig::Slack(
                section(&self.slack, "slack")?.to_webhook_config("slack")?,
            ),
            NotificationMethod::Discord => NotificationConfig::Discord(
                section(&self.discord, "discord")?.to_webhook_config("discord")?,
            ),
        })
    }
}

impl AppConfig {
    /// Environment variable naming an alternative config file.
    pub const PATH_ENV: &'static str = "TOKENKEEPER_CONFIG";

    /// Loads the default file, or the defaults when it does not exist.
    pub fn load() -> Result<Self, String> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Loads a specific file, which must exist.
    pub fn load_from(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
        Self::parse(&content).map_err(|e| format!("{}: {}", path.display(), e))
    }

    pub fn parse(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|e| format!("failed to parse config: {}", e))
    }

    /// Returns `~/.config/tokenkeeper/config.toml`.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tokenkeeper")
            .join("config.toml")
    }
}

/// Expands a leading `~/` to the home directory.
fn expand_home(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    path.to_path_buf()
}
