//! Chat webhook channels.

use std::time::Duration;

use serde_json::{Value, json};
use tokenkeeper_oauth::BoxFuture;

use super::NotificationChannel;
use crate::error::{ServerError, ServerResult};

/// Connection parameters of an incoming webhook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookConfig {
    pub url: String,
    pub timeout: Duration,
}

impl WebhookConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug)]
struct WebhookClient {
    name: &'static str,
    url: reqwest::Url,
    http_client: reqwest::Client,
}

impl WebhookClient {
    fn new(name: &'static str, config: &WebhookConfig) -> ServerResult<Self> {
        let url = reqwest::Url::parse(&config.url)
            .map_err(|e| ServerError::config(format!("invalid {} webhook URL: {}", name, e)))?;
        let http_client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ServerError::config(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self {
            name,
            url,
            http_client,
        })
    }

    async fn post(&self, payload: Value) -> ServerResult<()> {
        let response = self
            .http_client
            .post(self.url.clone())
            .json(&payload)
            .send()
            .await
            .map_err(|e| ServerError::delivery(self.name, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ServerError::delivery(
                self.name,
                format!("HTTP {}: {}", status, body),
            ));
        }
        Ok(())
    }
}

/// Slack incoming webhook.
#[derive(Debug)]
pub struct SlackChannel {
    client: WebhookClient,
}

impl SlackChannel {
    pub fn new(config: &WebhookConfig) -> ServerResult<Self> {
        Ok(Self {
            client: WebhookClient::new("slack", config)?,
        })
    }

    fn payload(subject: &str, body: &str) -> Value {
        json!({ "text": format!("*{}*\n{}", subject, body) })
    }
}

impl NotificationChannel for SlackChannel {
    fn name(&self) -> &'static str {
        "slack"
    }

    fn send<'a>(&'a self, subject: &'a str, body: &'a str) -> BoxFuture<'a, ServerResult<()>> {
        Box::pin(self.client.post(Self::payload(subject, body)))
    }
}

/// Discord webhook.
#[derive(Debug)]
pub struct DiscordChannel {
    client: WebhookClient,
}

impl DiscordChannel {
    pub fn new(config: &WebhookConfig) -> ServerResult<Self> {
        Ok(Self {
            client: WebhookClient::new("discord", config)?,
        })
    }

    fn payload(subject: &str, body: &str) -> Value {
        json!({ "content": format!("**{}**\n{}", subject, body) })
    }
}

impl NotificationChannel for DiscordChannel {
    fn name(&self) -> &'static str {
        "discord"
    }

    fn send<'a>(&'a self, subject: &'a str, body: &'a str) -> BoxFuture<'a, ServerResult<()>> {
        Box::pin(self.client.post(Self::payload(subject, body)))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::Json;
    use axum::http::StatusCode;
    use axum::routing::post;

    use super::*;

    /// Starts a hook that records payloads and answers with `status`.
    async fn mock_hook(status: StatusCode) -> (String, Arc<Mutex<Vec<Value>>>) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let app = axum::Router::new().route(
            "/hook",
            post(move |Json(payload): Json<Value>| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(payload);
                    status
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        (format!("http://{}/hook", addr), received)
    }

    #[test]
    fn payload_shapes() {
        assert_eq!(
            SlackChannel::payload("Subject", "Body"),
            json!({ "text": "*Subject*\nBody" })
        );
        assert_eq!(
            DiscordChannel::payload("Subject", "Body"),
            json!({ "content": "**Subject**\nBody" })
        );
    }

    #[test]
    fn invalid_url_is_config_error() {
        let err = SlackChannel::new(&WebhookConfig::new("not a url")).unwrap_err();
        assert!(matches!(err, ServerError::Config { .. }));
    }

    #[tokio::test]
    async fn slack_posts_text_payload() {
        let (url, received) = mock_hook(StatusCode::OK).await;
        let channel = SlackChannel::new(&WebhookConfig::new(url)).unwrap();

        channel.send("Subject", "Body").await.unwrap();

        let payloads = received.lock().unwrap();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0]["text"], "*Subject*\nBody");
    }

    #[tokio::test]
    async fn discord_accepts_no_content_response() {
        let (url, received) = mock_hook(StatusCode::NO_CONTENT).await;
        let channel = DiscordChannel::new(&WebhookConfig::new(url)).unwrap();

        channel.send("Subject", "Body").await.unwrap();
        assert_eq!(received.lock().unwrap()[0]["content"], "**Subject**\nBody");
    }

    #[tokio::test]
    async fn non_success_status_is_delivery_error() {
        let (url, _) = mock_hook(StatusCode::NOT_FOUND).await;
        let channel = DiscordChannel::new(&WebhookConfig::new(url)).unwrap();

        let err = channel.send("Subject", "Body").await.unwrap_err();
        assert!(matches!(
            err,
            ServerError::NotificationDelivery { ref channel, .. } if channel == "discord"
        ));
    }
}
