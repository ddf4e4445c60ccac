//! Token endpoint client.
//!
//! The [`TokenEndpoint`] trait is the seam between the refresh engine and the
//! network. [`HttpTokenEndpoint`] talks to the provider; tests substitute a
//! stub.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info};

use crate::config::ClientSecrets;
use crate::error::{AuthError, AuthResult};

/// A boxed future that is Send.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Response from the token endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TokenResponse {
    /// The new access token.
    pub access_token: String,
    /// A refresh token, present on code exchange with `access_type=offline`.
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Lifetime of the access token in seconds.
    #[serde(default)]
    pub expires_in: Option<i64>,
    /// Space-separated scopes actually granted.
    #[serde(default)]
    pub scope: Option<String>,
    /// Token type, normally `Bearer`.
    #[serde(default)]
    pub token_type: Option<String>,
}

impl TokenResponse {
    /// Returns the granted scopes, if the provider listed them.
    pub fn granted_scopes(&self) -> Option<Vec<String>> {
        self.scope
            .as_ref()
            .map(|s| s.split_whitespace().map(str::to_string).collect())
    }
}

/// Error body returned by the token endpoint.
#[derive(Debug, Deserialize)]
struct TokenErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Exchanges grants for tokens.
pub trait TokenEndpoint: Send + Sync {
    /// Exchanges an authorization code for tokens, proving possession of
    /// the PKCE `code_verifier`.
    fn exchange_code<'a>(
        &'a self,
        code: &'a str,
        redirect_uri: &'a str,
        code_verifier: &'a str,
    ) -> BoxFuture<'a, AuthResult<TokenResponse>>;

    /// Mints a new access token from a refresh token.
    fn refresh<'a>(&'a self, refresh_token: &'a str) -> BoxFuture<'a, AuthResult<TokenResponse>>;
}

/// Token endpoint backed by HTTP form posts.
#[derive(Debug)]
pub struct HttpTokenEndpoint {
    secrets: ClientSecrets,
    http_client: reqwest::Client,
}

impl HttpTokenEndpoint {
    /// Creates a new endpoint client.
    pub fn new(secrets: ClientSecrets, timeout: Duration, user_agent: &str) -> AuthResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| AuthError::internal(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            secrets,
            http_client,
        })
    }

    async fn post_form(
        &self,
        params: &[(&str, &str)],
        what: &str,
        rejected: fn(String) -> AuthError,
    ) -> AuthResult<TokenResponse> {
        debug!(token_uri = %self.secrets.token_uri, grant = what, "calling token endpoint");

        let response = self
            .http_client
            .post(&self.secrets.token_uri)
            .form(params)
            .send()
            .await
            .map_err(|e| AuthError::network(format!("{} request failed: {}", what, e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AuthError::network(format!("failed to read response: {}", e)))?;

        if !status.is_success() {
            let error_body = serde_json::from_str::<TokenErrorBody>(&body).ok();
            let rejection = is_rejection(status, error_body.as_ref().map(|e| e.error.as_str()));
            let detail = match error_body {
                Some(err) => match err.error_description {
                    Some(desc) => format!("{}: {}", err.error, desc),
                    None => err.error,
                },
                None => body,
            };
            if rejection {
                return Err(rejected(format!("{} rejected ({}): {}", what, status, detail)));
            }
            return Err(AuthError::network(format!(
                "{} failed ({}): {}",
                what, status, detail
            )));
        }

        serde_json::from_str(&body)
            .map_err(|e| AuthError::invalid_response(format!("invalid token response: {}", e)))
    }
}

/// OAuth error codes that mean the grant or client itself is bad.
const REJECTION_ERRORS: [&str; 3] = ["invalid_grant", "invalid_client", "unauthorized_client"];

/// Returns true if the provider refused the grant, as opposed to failing
/// to answer (rate limiting, timeouts, outages), which is worth retrying.
fn is_rejection(status: reqwest::StatusCode, error: Option<&str>) -> bool {
    if error.is_some_and(|code| REJECTION_ERRORS.contains(&code)) {
        return true;
    }
    matches!(status.as_u16(), 400 | 401) && error != Some("temporarily_unavailable")
}

impl TokenEndpoint for HttpTokenEndpoint {
    fn exchange_code<'a>(
        &'a self,
        code: &'a str,
        redirect_uri: &'a str,
        code_verifier: &'a str,
    ) -> BoxFuture<'a, AuthResult<TokenResponse>> {
        Box::pin(async move {
            let params = [
                ("client_id", self.secrets.client_id.as_str()),
                ("client_secret", self.secrets.client_secret.as_str()),
                ("code", code),
                ("code_verifier", code_verifier),
                ("grant_type", "authorization_code"),
                ("redirect_uri", redirect_uri),
            ];
            let response = self
                .post_form(&params, "token exchange", AuthError::callback_validation)
                .await?;
            info!("obtained tokens from authorization code");
            Ok(response)
        })
    }

    fn refresh<'a>(&'a self, refresh_token: &'a str) -> BoxFuture<'a, AuthResult<TokenResponse>> {
        Box::pin(async move {
            let params = [
                ("client_id", self.secrets.client_id.as_str()),
                ("client_secret", self.secrets.client_secret.as_str()),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ];
            let response = self
                .post_form(&params, "token refresh", AuthError::refresh_rejected)
                .await?;
            info!("refreshed access token");
            Ok(response)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_response_parses_minimal_body() {
        let response: TokenResponse =
            serde_json::from_str(r#"{"access_token": "t1", "expires_in": 3600}"#).unwrap();
        assert_eq!(response.access_token, "t1");
        assert_eq!(response.expires_in, Some(3600));
        assert!(response.refresh_token.is_none());
        assert!(response.granted_scopes().is_none());
    }

    #[test]
    fn token_response_splits_scopes() {
        let response = TokenResponse {
            access_token: "t1".into(),
            scope: Some("a b  c".into()),
            ..Default::default()
        };
        assert_eq!(
            response.granted_scopes(),
            Some(vec!["a".to_string(), "b".to_string(), "c".to_string()])
        );
    }

    /// Serves a single canned response on `/token`.
    async fn mock_token_server(status: u16, body: &'static str) -> String {
        use axum::Router;
        use axum::http::StatusCode;
        use axum::routing::post;

        let app = Router::new().route(
            "/token",
            post(move |_form: String| async move {
                (
                    StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                    body,
                )
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        format!("http://{}/token", addr)
    }

    async fn endpoint_for(status: u16, body: &'static str) -> HttpTokenEndpoint {
        let secrets =
            ClientSecrets::new("id", "secret").with_token_uri(mock_token_server(status, body).await);
        HttpTokenEndpoint::new(secrets, Duration::from_secs(5), "tokenkeeper-test").unwrap()
    }

    #[tokio::test]
    async fn refresh_success() {
        let endpoint = endpoint_for(
            200,
            r#"{"access_token": "new-access", "expires_in": 3599, "token_type": "Bearer"}"#,
        )
        .await;

        let response = endpoint.refresh("refresh").await.unwrap();
        assert_eq!(response.access_token, "new-access");
        assert_eq!(response.expires_in, Some(3599));
        assert!(response.refresh_token.is_none());
    }

    #[tokio::test]
    async fn refresh_invalid_grant_is_rejection() {
        let endpoint = endpoint_for(
            400,
            r#"{"error": "invalid_grant", "error_description": "Token has been expired or revoked."}"#,
        )
        .await;

        let err = endpoint.refresh("refresh").await.unwrap_err();
        assert_eq!(err.code(), crate::AuthErrorCode::RefreshRejected);
        assert!(err.message().contains("invalid_grant"));
        assert!(err.requires_reauth());
    }

    #[tokio::test]
    async fn server_error_is_transient() {
        let endpoint = endpoint_for(503, "unavailable").await;

        let err = endpoint.refresh("refresh").await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn rate_limit_is_transient() {
        let endpoint = endpoint_for(429, r#"{"error": "rate_limit_exceeded"}"#).await;

        let err = endpoint.refresh("refresh").await.unwrap_err();
        assert_eq!(err.code(), crate::AuthErrorCode::NetworkError);
        assert!(err.is_retryable());
        assert!(!err.requires_reauth());
    }

    #[tokio::test]
    async fn other_client_errors_are_transient() {
        for status in [403, 404, 408] {
            let endpoint = endpoint_for(status, "nope").await;
            let err = endpoint.refresh("refresh").await.unwrap_err();
            assert_eq!(err.code(), crate::AuthErrorCode::NetworkError, "status {}", status);
        }
    }

    #[tokio::test]
    async fn invalid_client_is_rejection_whatever_the_status() {
        let endpoint = endpoint_for(403, r#"{"error": "invalid_client"}"#).await;

        let err = endpoint.refresh("refresh").await.unwrap_err();
        assert_eq!(err.code(), crate::AuthErrorCode::RefreshRejected);
    }

    #[test]
    fn rejection_classification() {
        use reqwest::StatusCode;
        assert!(is_rejection(StatusCode::BAD_REQUEST, None));
        assert!(is_rejection(StatusCode::UNAUTHORIZED, Some("invalid_token")));
        assert!(!is_rejection(StatusCode::BAD_REQUEST, Some("temporarily_unavailable")));
        assert!(!is_rejection(StatusCode::TOO_MANY_REQUESTS, None));
        assert!(!is_rejection(StatusCode::REQUEST_TIMEOUT, None));
        assert!(is_rejection(StatusCode::FORBIDDEN, Some("unauthorized_client")));
    }

    #[tokio::test]
    async fn exchange_rejection_is_callback_validation() {
        let endpoint = endpoint_for(400, r#"{"error": "invalid_grant"}"#).await;

        let err = endpoint
            .exchange_code("code", "http://localhost:8080/callback", "verifier")
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::AuthErrorCode::CallbackValidation);
    }

    #[tokio::test]
    async fn garbage_body_is_invalid_response() {
        let endpoint = endpoint_for(200, "<html>nope</html>").await;

        let err = endpoint.refresh("refresh").await.unwrap_err();
        assert_eq!(err.code(), crate::AuthErrorCode::InvalidResponse);
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_network_error() {
        let secrets = ClientSecrets::new("id", "secret").with_token_uri("http://127.0.0.1:9/token");
        let endpoint =
            HttpTokenEndpoint::new(secrets, Duration::from_secs(2), "tokenkeeper-test").unwrap();

        let err = endpoint.refresh("refresh").await.unwrap_err();
        assert_eq!(err.code(), crate::AuthErrorCode::NetworkError);
    }
}
