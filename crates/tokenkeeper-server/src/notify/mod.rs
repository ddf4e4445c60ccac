//! Delivery of authorization links to a human.
//!
//! Exactly one channel is configured. When it fails the dispatcher does not
//! try another one; it writes the link to the log at `warn` so the operator
//! can always recover it from there.

mod email;
mod webhook;

use std::time::Duration;

use tokenkeeper_oauth::BoxFuture;
use tracing::{debug, info, warn};

use crate::error::ServerResult;

pub use email::{EmailChannel, EmailConfig, SmtpSecurity};
pub use webhook::{DiscordChannel, SlackChannel, WebhookConfig};

/// How long an authorization link stays usable by default.
pub const DEFAULT_LINK_VALIDITY: Duration = Duration::from_secs(600);

/// A way of reaching the operator.
pub trait NotificationChannel: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Delivers one message.
    fn send<'a>(&'a self, subject: &'a str, body: &'a str) -> BoxFuture<'a, ServerResult<()>>;
}

/// Which channel to build.
#[derive(Debug, Clone, Default)]
pub enum NotificationConfig {
    /// No channel; everything goes to the log.
    #[default]
    Log,
    Email(EmailConfig),
    Slack(WebhookConfig),
    Discord(WebhookConfig),
}

impl NotificationConfig {
    /// Returns the configuration name of the method.
    pub fn method(&self) -> &'static str {
        match self {
            Self::Log => "log",
            Self::Email(_) => "email",
            Self::Slack(_) => "slack",
            Self::Discord(_) => "discord",
        }
    }
}

/// A rendered notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub subject: String,
    pub body: String,
}

impl Message {
    /// Message asking the operator to open `url`.
    pub fn authorization(
        service: &str,
        url: &str,
        context: Option<&str>,
        validity: Duration,
    ) -> Self {
        let reason = context.map(|c| format!(" ({})", c)).unwrap_or_default();
        let minutes = validity.as_secs().div_ceil(60).max(1);
        let unit = if minutes == 1 { "minute" } else { "minutes" };
        Self {
            subject: format!("Authorization required for {}", service),
            body: format!(
                "The OAuth credential used by {service} needs to be renewed{reason}.\n\n\
                 Open this link to grant access:\n\n\
                 {url}\n\n\
                 This link is valid for {minutes} {unit}."
            ),
        }
    }

    /// Message confirming a completed reauthorization.
    pub fn success(service: &str) -> Self {
        Self {
            subject: format!("Authorization completed for {}", service),
            body: format!(
                "The OAuth credential used by {} was renewed successfully.",
                service
            ),
        }
    }
}

/// Sends notifications through the single configured channel.
pub struct NotificationDispatcher {
    channel: Option<Box<dyn NotificationChannel>>,
    service: String,
    link_validity: Duration,
}

impl std::fmt::Debug for NotificationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationDispatcher")
            .field("channel", &self.channel_name())
            .field("service", &self.service)
            .finish_non_exhaustive()
    }
}

impl NotificationDispatcher {
    /// Creates a dispatcher using `channel`.
    pub fn new(channel: Box<dyn NotificationChannel>) -> Self {
        Self {
            channel: Some(channel),
            service: "tokenkeeper".to_string(),
            link_validity: DEFAULT_LINK_VALIDITY,
        }
    }

    /// Creates a dispatcher that only writes to the log.
    pub fn log_only() -> Self {
        Self {
            channel: None,
            service: "tokenkeeper".to_string(),
            link_validity: DEFAULT_LINK_VALIDITY,
        }
    }

    /// Builds the channel described by `config`.
    pub fn from_config(config: &NotificationConfig) -> ServerResult<Self> {
        let dispatcher = match config {
            NotificationConfig::Log => Self::log_only(),
            NotificationConfig::Email(email) => Self::new(Box::new(EmailChannel::new(email)?)),
            NotificationConfig::Slack(hook) => Self::new(Box::new(SlackChannel::new(hook)?)),
            NotificationConfig::Discord(hook) => Self::new(Box::new(DiscordChannel::new(hook)?)),
        };
        Ok(dispatcher)
    }

    /// Sets the service name used in messages.
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }

    /// Sets the validity announced in authorization messages.
    pub fn with_link_validity(mut self, validity: Duration) -> Self {
        self.link_validity = validity;
        self
    }

    /// Returns the channel name, or `log`.
    pub fn channel_name(&self) -> &'static str {
        self.channel.as_ref().map_or("log", |c| c.name())
    }

    /// Sends the authorization link. Returns false if the channel failed.
    pub async fn send_auth_notification(&self, url: &str, context: Option<&str>) -> bool {
        let message = Message::authorization(&self.service, url, context, self.link_validity);

        let Some(channel) = self.channel.as_deref() else {
            warn!(url, "authorization required, open this URL to continue");
            return true;
        };

        match channel.send(&message.subject, &message.body).await {
            Ok(()) => {
                info!(channel = channel.name(), "authorization notification sent");
                debug!(url, "authorization URL");
                true
            }
            Err(e) => {
                warn!(
                    channel = channel.name(),
                    error = %e,
                    url,
                    "notification failed, open this URL to authorize"
                );
                false
            }
        }
    }

    /// Sends the success confirmation, best effort.
    pub async fn send_success_notification(&self) -> bool {
        let message = Message::success(&self.service);

        let Some(channel) = self.channel.as_deref() else {
            info!("{}", message.body);
            return true;
        };

        match channel.send(&message.subject, &message.body).await {
            Ok(()) => {
                debug!(channel = channel.name(), "success notification sent");
                true
            }
            Err(e) => {
                warn!(channel = channel.name(), error = %e, "success notification failed");
                false
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Arc, Mutex};

    use tokio::sync::mpsc;

    use super::*;
    use crate::error::ServerError;

    /// Channel that records messages and can be told to fail.
    #[derive(Clone)]
    pub struct RecordingChannel {
        pub sent: Arc<Mutex<Vec<Message>>>,
        pub fail: bool,
        pub urls: Option<mpsc::UnboundedSender<String>>,
    }

    impl RecordingChannel {
        pub fn new() -> Self {
            Self {
                sent: Arc::new(Mutex::new(Vec::new())),
                fail: false,
                urls: None,
            }
        }

        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Self::new()
            }
        }

        /// Forwards every link found in a message body to the receiver.
        pub fn with_url_sink(mut self) -> (Self, mpsc::UnboundedReceiver<String>) {
            let (tx, rx) = mpsc::unbounded_channel();
            self.urls = Some(tx);
            (self, rx)
        }

        pub fn messages(&self) -> Vec<Message> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl NotificationChannel for RecordingChannel {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn send<'a>(&'a self, subject: &'a str, body: &'a str) -> BoxFuture<'a, ServerResult<()>> {
            Box::pin(async move {
                self.sent.lock().unwrap().push(Message {
                    subject: subject.to_string(),
                    body: body.to_string(),
                });
                if self.fail {
                    return Err(ServerError::delivery("recording", "configured to fail"));
                }
                if let Some(tx) = &self.urls
                    && let Some(url) = body.lines().find(|l| l.starts_with("http"))
                {
                    let _ = tx.send(url.to_string());
                }
                Ok(())
            })
        }
    }
}
