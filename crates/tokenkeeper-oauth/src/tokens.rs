//! Credential persistence.
//!
//! The token file is a JSON document read and written only by
//! [`TokenStore`]. Downstream collaborators treat it as an opaque blob.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::ClientSecrets;
use crate::error::{AuthError, AuthResult};

/// An OAuth credential as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// The access token for API requests.
    #[serde(alias = "token")]
    pub access_token: String,

    /// The refresh token for minting new access tokens.
    ///
    /// Without one the credential cannot be renewed past its expiry.
    #[serde(default)]
    pub refresh_token: Option<String>,

    /// Token endpoint the refresh token is valid against.
    #[serde(default)]
    pub token_uri: String,

    /// Client the credential was issued to.
    #[serde(default)]
    pub client_id: String,

    /// Secret of the client the credential was issued to.
    #[serde(default)]
    pub client_secret: String,

    /// The OAuth scopes that were granted.
    #[serde(default)]
    pub scopes: Vec<String>,

    /// When the access token expires, if the provider told us.
    #[serde(default)]
    pub expiry: Option<DateTime<Utc>>,
}

impl Credential {
    /// Creates a credential bound to the given client.
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: Option<String>,
        expires_in_secs: Option<i64>,
        scopes: Vec<String>,
        secrets: &ClientSecrets,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token,
            token_uri: secrets.token_uri.clone(),
            client_id: secrets.client_id.clone(),
            client_secret: secrets.client_secret.clone(),
            scopes,
            expiry: expires_in_secs.map(|secs| Utc::now() + Duration::seconds(secs)),
        }
    }

    /// Returns true if the access token is past its expiry.
    ///
    /// A credential without an expiry is never considered expired here; the
    /// expiration check applies its own policy for that case.
    pub fn is_expired(&self) -> bool {
        self.expiry.is_some_and(|expiry| Utc::now() >= expiry)
    }

    /// Returns true if `now + buffer` has reached the expiry.
    pub fn expires_within(&self, buffer: Duration) -> Option<bool> {
        self.expiry.map(|expiry| Utc::now() + buffer >= expiry)
    }

    /// Returns true if the credential can be renewed without a human.
    pub fn can_refresh(&self) -> bool {
        self.refresh_token.as_deref().is_some_and(|t| !t.is_empty())
    }

    /// Returns true if the credential has all the required scopes.
    pub fn has_scopes(&self, required: &[String]) -> bool {
        required.iter().all(|scope| self.scopes.contains(scope))
    }

    /// Applies a refresh result in place.
    ///
    /// Providers usually omit the refresh token on refresh; the old one is
    /// kept in that case.
    pub fn apply_refresh(
        &mut self,
        access_token: impl Into<String>,
        refresh_token: Option<String>,
        expires_in_secs: Option<i64>,
    ) {
        self.access_token = access_token.into();
        if let Some(token) = refresh_token {
            self.refresh_token = Some(token);
        }
        self.expiry = expires_in_secs.map(|secs| Utc::now() + Duration::seconds(secs));
    }

    /// Returns the time until the token expires, if known.
    pub fn time_until_expiry(&self) -> Option<Duration> {
        self.expiry.map(|expiry| expiry - Utc::now())
    }
}

/// File-backed credential storage.
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    /// Creates a store backed by the given path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the token file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the credential from disk.
    ///
    /// Fails with `TokenNotFound` if the file is absent and `TokenMalformed`
    /// if it cannot be parsed. Callers treat both as "no credential".
    pub fn load(&self) -> AuthResult<Credential> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no token file");
                return Err(AuthError::token_not_found(format!(
                    "no token file at {}",
                    self.path.display()
                )));
            }
            Err(e) => {
                return Err(AuthError::token_malformed(format!(
                    "failed to read token file: {}",
                    e
                ))
                .with_source(e));
            }
        };

        let credential: Credential = serde_json::from_str(&content).map_err(|e| {
            AuthError::token_malformed(format!("failed to parse token file: {}", e))
        })?;

        if credential.access_token.is_empty() {
            return Err(AuthError::token_malformed("token file has no access token"));
        }

        debug!(path = %self.path.display(), "loaded credential");
        Ok(credential)
    }

    /// Overwrites the token file with the given credential.
    pub fn save(&self, credential: &Credential) -> AuthResult<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|e| {
                AuthError::internal(format!("failed to create token directory: {}", e))
            })?;
        }

        // Write to temp file first, then rename for atomicity
        let temp_path = self.path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(credential)
            .map_err(|e| AuthError::internal(format!("failed to serialize credential: {}", e)))?;

        fs::write(&temp_path, &content)
            .map_err(|e| AuthError::internal(format!("failed to write token file: {}", e)))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&temp_path, fs::Permissions::from_mode(0o600));
        }

        fs::rename(&temp_path, &self.path)
            .map_err(|e| AuthError::internal(format!("failed to rename token file: {}", e)))?;

        debug!(path = %self.path.display(), "saved credential");
        Ok(())
    }

    /// Deletes the token file. Used only for invalidation.
    pub fn clear(&self) -> AuthResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "cleared stored credential");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AuthError::internal(format!(
                "failed to remove token file: {}",
                e
            ))),
        }
    }

    /// Returns true if a token file exists.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }
}
