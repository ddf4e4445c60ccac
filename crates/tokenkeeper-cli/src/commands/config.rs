//! `tokenkeeper config`

use std::path::Path;

use tokenkeeper_server::NotificationDispatcher;

use crate::config::AppConfig;
use crate::error::{ClientError, ClientResult};

/// Prints the effective configuration.
///
/// Secret references are printed as written, never resolved.
pub fn dump(config: &AppConfig, path: Option<&Path>) -> ClientResult<()> {
    let toml_str = toml::to_string_pretty(config)
        .map_err(|e| ClientError::Config(format!("failed to serialize config: {}", e)))?;
    let default_path = AppConfig::default_path();
    println!("# config.toml ({})", path.unwrap_or(&default_path).display());
    println!("{}", toml_str);
    Ok(())
}

/// Resolves every secret and builds every component without starting any.
pub fn validate(config: &AppConfig) -> ClientResult<()> {
    let oauth = config.oauth.to_oauth_config().map_err(ClientError::Config)?;
    println!("OAuth client:   {}", oauth.secrets.client_id);
    println!("Token file:     {}", oauth.token_path.display());

    let monitor = config
        .monitor
        .to_orchestrator_config()
        .map_err(ClientError::Config)?;
    println!("Check interval: {}s", monitor.check_interval.as_secs());

    let callback = config.callback.to_callback_config();
    println!("Redirect URI:   {}", callback.redirect_uri(callback.port));

    let notification = config
        .notifications
        .to_notification_config()
        .map_err(ClientError::Config)?;
    let dispatcher = NotificationDispatcher::from_config(&notification)?;
    println!("Notifications:  {}", dispatcher.channel_name());

    println!("Configuration is valid.");
    Ok(())
}

/// Shows the configuration file path.
pub fn path(path: Option<&Path>) -> ClientResult<()> {
    let default_path = AppConfig::default_path();
    let path = path.unwrap_or(&default_path);
    let note = if path.exists() { "" } else { " (not found, using defaults)" };
    println!("config: {}{}", path.display(), note);
    Ok(())
}
