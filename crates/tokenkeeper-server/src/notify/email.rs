//! SMTP channel.

use std::time::Duration;

use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tokenkeeper_oauth::BoxFuture;

use super::NotificationChannel;
use crate::error::{ServerError, ServerResult};

/// Transport security for the SMTP connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SmtpSecurity {
    /// Plain connection upgraded with STARTTLS (port 587).
    #[default]
    StartTls,
    /// Implicit TLS (port 465).
    Tls,
    /// No encryption. Only for local relays.
    Plain,
}

impl SmtpSecurity {
    /// The conventional port for this mode.
    pub fn default_port(&self) -> u16 {
        match self {
            Self::StartTls => 587,
            Self::Tls => 465,
            Self::Plain => 25,
        }
    }
}

impl std::str::FromStr for SmtpSecurity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "starttls" => Ok(Self::StartTls),
            "tls" | "ssl" => Ok(Self::Tls),
            "plain" | "none" => Ok(Self::Plain),
            other => Err(format!(
                "unknown SMTP security '{}', expected starttls, tls or plain",
                other
            )),
        }
    }
}

/// SMTP connection parameters.
#[derive(Clone, PartialEq, Eq)]
pub struct EmailConfig {
    pub smtp_host: String,
    /// Defaults to the conventional port of `security`.
    pub smtp_port: Option<u16>,
    pub security: SmtpSecurity,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: String,
    pub to: Vec<String>,
    pub timeout: Duration,
}

impl std::fmt::Debug for EmailConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmailConfig")
            .field("smtp_host", &self.smtp_host)
            .field("smtp_port", &self.smtp_port)
            .field("security", &self.security)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("from", &self.from)
            .field("to", &self.to)
            .finish()
    }
}

impl EmailConfig {
    pub fn new(smtp_host: impl Into<String>, from: impl Into<String>, to: Vec<String>) -> Self {
        Self {
            smtp_host: smtp_host.into(),
            smtp_port: None,
            security: SmtpSecurity::default(),
            username: None,
            password: None,
            from: from.into(),
            to,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_security(mut self, security: SmtpSecurity) -> Self {
        self.security = security;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.smtp_port = Some(port);
        self
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn port(&self) -> u16 {
        self.smtp_port
            .unwrap_or_else(|| self.security.default_port())
    }
}

/// Sends notifications as plain-text email.
pub struct EmailChannel {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Vec<Mailbox>,
}

impl std::fmt::Debug for EmailChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmailChannel")
            .field("from", &self.from.to_string())
            .field("recipients", &self.to.len())
            .finish_non_exhaustive()
    }
}

impl EmailChannel {
    /// Validates addresses and prepares the SMTP transport.
    ///
    /// No connection is made until the first message is sent.
    pub fn new(config: &EmailConfig) -> ServerResult<Self> {
        let from: Mailbox = config
            .from
            .parse()
            .map_err(|e| ServerError::config(format!("invalid sender '{}': {}", config.from, e)))?;

        if config.to.is_empty() {
            return Err(ServerError::config("email notifications need a recipient"));
        }
        let to = config
            .to
            .iter()
            .map(|addr| {
                addr.parse::<Mailbox>()
                    .map_err(|e| ServerError::config(format!("invalid recipient '{}': {}", addr, e)))
            })
            .collect::<ServerResult<Vec<_>>>()?;

        let builder = match config.security {
            SmtpSecurity::StartTls => {
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
                    .map_err(|e| ServerError::config(format!("invalid SMTP relay: {}", e)))?
            }
            SmtpSecurity::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_host)
                .map_err(|e| ServerError::config(format!("invalid SMTP relay: {}", e)))?,
            SmtpSecurity::Plain => {
                AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.smtp_host)
            }
        };

        let mut builder = builder.port(config.port()).timeout(Some(config.timeout));
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        Ok(Self {
            transport: builder.build(),
            from,
            to,
        })
    }

    fn build_message(&self, subject: &str, body: &str) -> ServerResult<Message> {
        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(subject)
            .header(ContentType::TEXT_PLAIN);
        for recipient in &self.to {
            builder = builder.to(recipient.clone());
        }
        builder
            .body(body.to_string())
            .map_err(|e| ServerError::delivery("email", format!("failed to build message: {}", e)))
    }
}

impl NotificationChannel for EmailChannel {
    fn name(&self) -> &'static str {
        "email"
    }

    fn send<'a>(&'a self, subject: &'a str, body: &'a str) -> BoxFuture<'a, ServerResult<()>> {
        Box::pin(async move {
            let message = self.build_message(subject, body)?;
            self.transport
                .send(message)
                .await
                .map_err(|e| ServerError::delivery("email", e.to_string()))?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> EmailConfig {
        EmailConfig::new(
            "smtp.example.com",
            "Token Keeper <tokenkeeper@example.com>",
            vec!["ops@example.com".to_string()],
        )
    }

    #[test]
    fn security_parsing_and_ports() {
        assert_eq!("STARTTLS".parse::<SmtpSecurity>(), Ok(SmtpSecurity::StartTls));
        assert_eq!("ssl".parse::<SmtpSecurity>(), Ok(SmtpSecurity::Tls));
        assert_eq!("none".parse::<SmtpSecurity>(), Ok(SmtpSecurity::Plain));
        assert!("smoke-signals".parse::<SmtpSecurity>().is_err());

        assert_eq!(config().port(), 587);
        assert_eq!(config().with_security(SmtpSecurity::Tls).port(), 465);
        assert_eq!(config().with_port(2525).port(), 2525);
    }

    #[test]
    fn debug_hides_password() {
        let config = config().with_credentials("user", "hunter2");
        let debug = format!("{:?}", config);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("***"));
    }

    #[tokio::test]
    async fn builds_message_for_every_recipient() {
        let mut config = config().with_security(SmtpSecurity::Plain);
        config.to.push("Second <second@example.com>".to_string());
        let channel = EmailChannel::new(&config).unwrap();

        let message = channel.build_message("Subject", "Body").unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();
        assert!(raw.contains("Subject: Subject"));
        assert!(raw.contains("ops@example.com"));
        assert!(raw.contains("second@example.com"));
    }

    #[test]
    fn rejects_bad_addresses() {
        let mut bad_from = config();
        bad_from.from = "not an address".to_string();
        assert!(EmailChannel::new(&bad_from).is_err());

        let mut no_recipients = config();
        no_recipients.to.clear();
        assert!(EmailChannel::new(&no_recipients).is_err());
    }
}
