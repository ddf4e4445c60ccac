//! Daemon: reauthorization orchestrator, monitor loop, notifications.
//!
//! This crate keeps an OAuth2 credential alive without a human in the loop as
//! long as the refresh token works, and pages a human when it stops working:
//! - [`Orchestrator`] - check, silent refresh, interactive reauthorization
//! - [`Monitor`] - fixed-interval background loop driving the orchestrator
//! - [`NotificationDispatcher`] - delivers the authorization link via email,
//!   Slack or Discord, falling back to the log
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tokenkeeper_oauth::{CallbackConfig, ClientSecrets, OAuthConfig, RefreshEngine};
//! use tokenkeeper_server::{NotificationDispatcher, Orchestrator, OrchestratorConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let secrets = ClientSecrets::from_file("client_secret.json")?;
//!     let engine = Arc::new(RefreshEngine::from_config(OAuthConfig::new(secrets))?);
//!     let orchestrator = Orchestrator::new(
//!         OrchestratorConfig::default(),
//!         engine,
//!         CallbackConfig::default(),
//!         NotificationDispatcher::log_only(),
//!     );
//!
//!     if let Some(credential) = orchestrator.get_valid_credentials().await {
//!         println!("expires at {:?}", credential.expiry);
//!     }
//!     Ok(())
//! }
//! ```

mod error;
pub mod logging;
mod monitor;
pub mod notify;
mod orchestrator;
mod signals;

pub use error::{ServerError, ServerResult};
pub use monitor::{
    CycleKind, Monitor, MonitorCommand, MonitorHandle, MonitorState, SharedMonitorState,
};
pub use notify::{
    DiscordChannel, EmailChannel, EmailConfig, Message, NotificationChannel, NotificationConfig,
    NotificationDispatcher, SlackChannel, SmtpSecurity, WebhookConfig,
};
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use signals::SignalHandler;
