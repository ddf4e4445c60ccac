//! OAuth client configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{AuthError, AuthResult};

/// Default authorization endpoint.
pub const DEFAULT_AUTH_URI: &str = "https://accounts.google.com/o/oauth2/v2/auth";

/// Default token endpoint.
pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// Registered OAuth client credentials and provider endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSecrets {
    /// The OAuth 2.0 client ID.
    pub client_id: String,
    /// The OAuth 2.0 client secret.
    pub client_secret: String,
    /// Authorization endpoint the consent URL points at.
    pub auth_uri: String,
    /// Token endpoint used for code exchange and refresh.
    pub token_uri: String,
}

/// Structure of a provider "client secrets" JSON file.
///
/// Supports the console format with an `installed` or `web` section as well
/// as a flat format with the fields at the root.
#[derive(Debug, Deserialize)]
struct ClientSecretsFile {
    installed: Option<NestedSecrets>,
    web: Option<NestedSecrets>,
    client_id: Option<String>,
    client_secret: Option<String>,
    auth_uri: Option<String>,
    token_uri: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NestedSecrets {
    client_id: String,
    client_secret: String,
    auth_uri: Option<String>,
    token_uri: Option<String>,
}

impl ClientSecrets {
    /// Creates client secrets using the default endpoints.
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            auth_uri: DEFAULT_AUTH_URI.to_string(),
            token_uri: DEFAULT_TOKEN_URI.to_string(),
        }
    }

    /// Overrides the authorization endpoint.
    pub fn with_auth_uri(mut self, uri: impl Into<String>) -> Self {
        self.auth_uri = uri.into();
        self
    }

    /// Overrides the token endpoint.
    pub fn with_token_uri(mut self, uri: impl Into<String>) -> Self {
        self.token_uri = uri.into();
        self
    }

    /// Loads client secrets from a JSON file.
    ///
    /// A missing or unreadable file is a configuration error, which is fatal
    /// to startup.
    pub fn from_file(path: impl AsRef<Path>) -> AuthResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            AuthError::configuration(format!(
                "failed to read client secrets {}: {}",
                path.display(),
                e
            ))
            .with_source(e)
        })?;
        Self::from_json(&content)
    }

    /// Parses client secrets from a JSON string.
    pub fn from_json(json: &str) -> AuthResult<Self> {
        let file: ClientSecretsFile = serde_json::from_str(json).map_err(|e| {
            AuthError::configuration(format!("failed to parse client secrets JSON: {}", e))
        })?;

        if let Some(nested) = file.installed.or(file.web) {
            let mut secrets = Self::new(nested.client_id, nested.client_secret);
            if let Some(uri) = nested.auth_uri {
                secrets.auth_uri = uri;
            }
            if let Some(uri) = nested.token_uri {
                secrets.token_uri = uri;
            }
            return Ok(secrets);
        }

        if let (Some(client_id), Some(client_secret)) = (file.client_id, file.client_secret) {
            let mut secrets = Self::new(client_id, client_secret);
            if let Some(uri) = file.auth_uri {
                secrets.auth_uri = uri;
            }
            if let Some(uri) = file.token_uri {
                secrets.token_uri = uri;
            }
            return Ok(secrets);
        }

        Err(AuthError::configuration(
            "client secrets must contain an 'installed'/'web' section or 'client_id'/'client_secret' at root level",
        ))
    }

    /// Validates that the secrets are usable.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.client_id.is_empty() {
            return Err("client_id is required");
        }
        if self.client_secret.is_empty() {
            return Err("client_secret is required");
        }
        if url::Url::parse(&self.auth_uri).is_err() {
            return Err("auth_uri is not a valid URL");
        }
        if url::Url::parse(&self.token_uri).is_err() {
            return Err("token_uri is not a valid URL");
        }
        Ok(())
    }
}

/// Configuration for the refresh engine.
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    /// Client credentials and endpoints.
    pub secrets: ClientSecrets,

    /// Scopes requested during authorization.
    pub scopes: Vec<String>,

    /// Where the credential is persisted.
    pub token_path: PathBuf,

    /// Timeout for token endpoint requests.
    pub timeout: Duration,

    /// User agent for token endpoint requests.
    pub user_agent: String,

    /// How to treat a credential whose expiry is unknown when checking
    /// expiration. `true` reports it as needing a refresh.
    pub refresh_when_expiry_unknown: bool,
}

impl OAuthConfig {
    /// Default request timeout in seconds.
    pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

    /// Default scopes: calendar, contacts and drive.
    pub const DEFAULT_SCOPES: [&'static str; 3] = [
        "https://www.googleapis.com/auth/calendar",
        "https://www.googleapis.com/auth/contacts",
        "https://www.googleapis.com/auth/drive",
    ];

    /// Creates a new configuration with the given secrets.
    pub fn new(secrets: ClientSecrets) -> Self {
        Self {
            secrets,
            scopes: Self::DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect(),
            token_path: Self::default_token_path(),
            timeout: Duration::from_secs(Self::DEFAULT_TIMEOUT_SECS),
            user_agent: format!("tokenkeeper/{}", env!("CARGO_PKG_VERSION")),
            refresh_when_expiry_unknown: true,
        }
    }

    /// Returns the default token storage path.
    pub fn default_token_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tokenkeeper")
            .join("token.json")
    }

    /// Sets the scopes.
    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    /// Sets the token storage path.
    pub fn with_token_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.token_path = path.into();
        self
    }

    /// Sets the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the policy for credentials without an expiry.
    pub fn with_refresh_when_expiry_unknown(mut self, refresh: bool) -> Self {
        self.refresh_when_expiry_unknown = refresh;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), String> {
        self.secrets
            .validate()
            .map_err(|e| format!("invalid client secrets: {}", e))?;

        if self.scopes.is_empty() {
            return Err("at least one OAuth scope is required".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_secrets() -> ClientSecrets {
        ClientSecrets::new("test-client.apps.googleusercontent.com", "test-secret")
    }

    #[test]
    fn secrets_validation() {
        assert!(test_secrets().validate().is_ok());
        assert!(ClientSecrets::new("", "secret").validate().is_err());
        assert!(ClientSecrets::new("id", "").validate().is_err());
        assert!(test_secrets().with_token_uri("not a url").validate().is_err());
    }

    #[test]
    fn secrets_from_json_installed() {
        let json = r#"{
            "installed": {
                "client_id": "test-id.apps.googleusercontent.com",
                "client_secret": "test-secret",
                "project_id": "my-project",
                "auth_uri": "https://accounts.example.com/auth",
                "token_uri": "https://oauth2.example.com/token"
            }
        }"#;

        let secrets = ClientSecrets::from_json(json).unwrap();
        assert_eq!(secrets.client_id, "test-id.apps.googleusercontent.com");
        assert_eq!(secrets.client_secret, "test-secret");
        assert_eq!(secrets.auth_uri, "https://accounts.example.com/auth");
        assert_eq!(secrets.token_uri, "https://oauth2.example.com/token");
    }

    #[test]
    fn secrets_from_json_web_uses_default_endpoints() {
        let json = r#"{
            "web": {
                "client_id": "web-id",
                "client_secret": "web-secret"
            }
        }"#;

        let secrets = ClientSecrets::from_json(json).unwrap();
        assert_eq!(secrets.client_id, "web-id");
        assert_eq!(secrets.auth_uri, DEFAULT_AUTH_URI);
        assert_eq!(secrets.token_uri, DEFAULT_TOKEN_URI);
    }

    #[test]
    fn secrets_from_json_flat() {
        let json = r#"{
            "client_id": "flat-id",
            "client_secret": "flat-secret",
            "refresh_token": "ignored"
        }"#;

        let secrets = ClientSecrets::from_json(json).unwrap();
        assert_eq!(secrets.client_id, "flat-id");
        assert_eq!(secrets.client_secret, "flat-secret");
    }

    #[test]
    fn secrets_from_json_invalid() {
        let err = ClientSecrets::from_json(r#"{ "other": {} }"#).unwrap_err();
        assert_eq!(err.code(), crate::AuthErrorCode::ConfigurationError);

        let err = ClientSecrets::from_json("not json").unwrap_err();
        assert!(err.message().contains("parse"));
    }

    #[test]
    fn secrets_from_missing_file_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ClientSecrets::from_file(dir.path().join("missing.json")).unwrap_err();
        assert_eq!(err.code(), crate::AuthErrorCode::ConfigurationError);
    }

    #[test]
    fn config_defaults() {
        let config = OAuthConfig::new(test_secrets());
        assert_eq!(config.scopes.len(), 3);
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert!(config.refresh_when_expiry_unknown);
        assert!(config.token_path.ends_with("tokenkeeper/token.json"));
    }

    #[test]
    fn config_validation() {
        assert!(OAuthConfig::new(test_secrets()).validate().is_ok());

        let bad = OAuthConfig::new(test_secrets()).with_scopes(vec![]);
        assert!(bad.validate().is_err());
    }
}
