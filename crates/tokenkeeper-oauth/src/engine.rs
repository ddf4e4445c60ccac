//! Expiry policy, silent refresh and authorization-code exchange.
//!
//! # State machine
//!
//! ```text
//! NO_CREDENTIAL ──initiate+complete──▶ VALID ──time──▶ EXPIRING_SOON
//!       ▲                                ▲                  │
//!       │                                └────refresh───────┤
//!       └──────────────refresh rejected─────────────────────┘
//! ```
//!
//! The engine is constructed explicitly and shared by reference; there is no
//! process-wide instance.

use std::sync::{Arc, Mutex};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use rand::Rng as _;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

use crate::config::OAuthConfig;
use crate::endpoint::{HttpTokenEndpoint, TokenEndpoint, TokenResponse};
use crate::error::{AuthError, AuthErrorCode, AuthResult};
use crate::tokens::{Credential, TokenStore};

/// Random bytes in a CSRF state token (256 bits).
const STATE_LENGTH: usize = 32;

/// Random bytes in a PKCE code verifier (86 characters once encoded).
const CODE_VERIFIER_LENGTH: usize = 64;

/// A freshly built authorization request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationRequest {
    /// The URL a human must open to grant consent.
    pub url: String,
    /// The CSRF state embedded in the URL.
    pub state: String,
    /// Where the provider will redirect after consent.
    pub redirect_uri: String,
}

#[derive(Debug)]
struct PendingFlow {
    state: String,
    redirect_uri: String,
    code_verifier: String,
}

/// Result of an expiration check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpirationStatus {
    /// Whether the credential must be refreshed or reauthorized.
    pub needs_refresh: bool,
    /// The access token expiry, if a credential with a known expiry exists.
    pub expiry: Option<DateTime<Utc>>,
}

/// Owns the credential lifecycle.
pub struct RefreshEngine {
    config: OAuthConfig,
    store: TokenStore,
    endpoint: Arc<dyn TokenEndpoint>,
    /// Held across network refreshes so concurrent callers refresh once.
    cache: AsyncMutex<Option<Credential>>,
    pending: Mutex<Option<PendingFlow>>,
}

impl std::fmt::Debug for RefreshEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshEngine")
            .field("token_path", &self.store.path())
            .field("scopes", &self.config.scopes)
            .finish_non_exhaustive()
    }
}

impl RefreshEngine {
    /// Creates an engine that uses the given token endpoint.
    pub fn new(config: OAuthConfig, endpoint: Arc<dyn TokenEndpoint>) -> Self {
        let store = TokenStore::new(&config.token_path);
        Self {
            config,
            store,
            endpoint,
            cache: AsyncMutex::new(None),
            pending: Mutex::new(None),
        }
    }

    /// Creates an engine that talks to the configured token endpoint over HTTP.
    pub fn from_config(config: OAuthConfig) -> AuthResult<Self> {
        config.validate().map_err(AuthError::configuration)?;
        let endpoint =
            HttpTokenEndpoint::new(config.secrets.clone(), config.timeout, &config.user_agent)?;
        Ok(Self::new(config, Arc::new(endpoint)))
    }

    /// Returns the engine configuration.
    pub fn config(&self) -> &OAuthConfig {
        &self.config
    }

    /// Returns the backing token store.
    pub fn store(&self) -> &TokenStore {
        &self.store
    }

    /// Returns a valid credential, refreshing it silently if it has expired.
    ///
    /// Returns `None` when no usable credential exists; callers treat that as
    /// "temporarily unavailable".
    pub async fn get_credentials(&self) -> Option<Credential> {
        let mut cache = self.cache.lock().await;

        if let Some(credential) = cache.as_ref()
            && !credential.is_expired()
        {
            return Some(credential.clone());
        }

        let credential = match self.store.load() {
            Ok(credential) => credential,
            Err(e) => {
                debug!(error = %e, "no stored credential");
                *cache = None;
                return None;
            }
        };

        if !credential.is_expired() {
            *cache = Some(credential.clone());
            return Some(credential);
        }

        if !credential.can_refresh() {
            info!("credential expired and has no refresh token");
            *cache = None;
            return None;
        }

        match self.refresh_locked(&mut cache, credential).await {
            Ok(credential) => Some(credential),
            Err(e) => {
                self.handle_refresh_failure(&mut cache, &e);
                None
            }
        }
    }

    /// Forces a silent refresh using the stored refresh token.
    pub async fn refresh_credentials(&self) -> AuthResult<Credential> {
        let mut cache = self.cache.lock().await;

        let credential = match cache.clone() {
            Some(credential) => credential,
            None => self.store.load()?,
        };

        if !credential.can_refresh() {
            return Err(AuthError::refresh_rejected(
                "credential has no refresh token; reauthorization required",
            ));
        }

        match self.refresh_locked(&mut cache, credential).await {
            Ok(credential) => Ok(credential),
            Err(e) => {
                self.handle_refresh_failure(&mut cache, &e);
                Err(e)
            }
        }
    }

    async fn refresh_locked(
        &self,
        cache: &mut Option<Credential>,
        mut credential: Credential,
    ) -> AuthResult<Credential> {
        let refresh_token = credential
            .refresh_token
            .clone()
            .ok_or_else(|| AuthError::refresh_rejected("no refresh token"))?;

        debug!("refreshing access token");
        let response = self.endpoint.refresh(&refresh_token).await?;

        credential.apply_refresh(
            response.access_token,
            response.refresh_token,
            response.expires_in,
        );
        self.store.save(&credential)?;
        *cache = Some(credential.clone());

        info!(expiry = ?credential.expiry, "credential refreshed");
        Ok(credential)
    }

    fn handle_refresh_failure(&self, cache: &mut Option<Credential>, err: &AuthError) {
        match err.code() {
            AuthErrorCode::RefreshRejected => {
                error!(error = %err, "refresh rejected by provider, invalidating credential");
                *cache = None;
                if let Err(e) = self.store.clear() {
                    warn!(error = %e, "failed to clear rejected credential");
                }
            }
            _ => {
                warn!(error = %err, "credential refresh failed");
            }
        }
    }

    /// Reports whether the credential expires within `buffer`.
    ///
    /// Returns `needs_refresh = true` when no credential exists, and when the
    /// expiry is unknown unless the configuration opts out.
    pub async fn check_token_expiration(&self, buffer: Duration) -> ExpirationStatus {
        let credential = {
            let mut cache = self.cache.lock().await;
            match cache.as_ref() {
                Some(credential) => Some(credential.clone()),
                None => match self.store.load() {
                    Ok(credential) => {
                        *cache = Some(credential.clone());
                        Some(credential)
                    }
                    Err(e) => {
                        debug!(error = %e, "expiration check found no credential");
                        None
                    }
                },
            }
        };

        let Some(credential) = credential else {
            return ExpirationStatus {
                needs_refresh: true,
                expiry: None,
            };
        };

        match credential.expires_within(buffer) {
            Some(needs_refresh) => ExpirationStatus {
                needs_refresh,
                expiry: credential.expiry,
            },
            None => {
                debug!(
                    refresh = self.config.refresh_when_expiry_unknown,
                    "credential has no expiry"
                );
                ExpirationStatus {
                    needs_refresh: self.config.refresh_when_expiry_unknown,
                    expiry: None,
                }
            }
        }
    }

    /// Builds the consent URL and records a pending flow.
    ///
    /// Any earlier pending flow is discarded; only the latest state can
    /// complete.
    pub fn initiate_auth_flow(&self, redirect_uri: &str) -> AuthResult<AuthorizationRequest> {
        let state = generate_state();
        let code_verifier = generate_code_verifier();
        let url = self.build_auth_url(redirect_uri, &state, &code_challenge(&code_verifier))?;

        let mut pending = self
            .pending
            .lock()
            .map_err(|_| AuthError::internal("pending flow lock poisoned"))?;
        *pending = Some(PendingFlow {
            state: state.clone(),
            redirect_uri: redirect_uri.to_string(),
            code_verifier,
        });

        debug!(redirect_uri, "authorization flow initiated");
        Ok(AuthorizationRequest {
            url,
            state,
            redirect_uri: redirect_uri.to_string(),
        })
    }

    fn build_auth_url(
        &self,
        redirect_uri: &str,
        state: &str,
        challenge: &str,
    ) -> AuthResult<String> {
        let mut url = url::Url::parse(&self.config.secrets.auth_uri)
            .map_err(|e| AuthError::configuration(format!("invalid auth_uri: {}", e)))?;

        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.config.secrets.client_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("scope", &self.config.scopes.join(" "))
            .append_pair("access_type", "offline")
            .append_pair("prompt", "consent")
            .append_pair("state", state)
            .append_pair("code_challenge", challenge)
            .append_pair("code_challenge_method", "S256");

        Ok(url.into())
    }

    #[cfg(test)]
    pub(crate) fn has_pending_flow(&self) -> bool {
        self.pending
            .lock()
            .map(|pending| pending.is_some())
            .unwrap_or(false)
    }

    /// Completes the pending flow from the full callback URL.
    ///
    /// Returns false on any failure, including a missing pending flow. The
    /// stored credential is untouched unless the exchange succeeds.
    pub async fn complete_auth_flow(&self, callback_url: &str) -> bool {
        match self.try_complete_auth_flow(callback_url).await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "authorization flow failed");
                false
            }
        }
    }

    /// Fallible form of [`complete_auth_flow`](Self::complete_auth_flow).
    pub async fn try_complete_auth_flow(&self, callback_url: &str) -> AuthResult<Credential> {
        let callback = url::Url::parse(callback_url)
            .map_err(|e| AuthError::callback_validation(format!("invalid callback URL: {}", e)))?;

        let mut code = None;
        let mut state = None;
        let mut provider_error = None;
        for (key, value) in callback.query_pairs() {
            match key.as_ref() {
                "code" => code = Some(value.into_owned()),
                "state" => state = Some(value.into_owned()),
                "error" => provider_error = Some(value.into_owned()),
                _ => {}
            }
        }

        // A pending flow is single use, whatever the outcome.
        let flow = self
            .pending
            .lock()
            .map_err(|_| AuthError::internal("pending flow lock poisoned"))?
            .take()
            .ok_or_else(AuthError::no_pending_flow)?;

        if !state.as_deref().is_some_and(|s| states_match(s, &flow.state)) {
            return Err(AuthError::callback_validation(
                "state mismatch; possible forged callback",
            ));
        }

        if let Some(err) = provider_error {
            return Err(AuthError::callback_validation(format!(
                "authorization denied: {}",
                err
            )));
        }

        let code = code
            .filter(|c| !c.is_empty())
            .ok_or_else(|| AuthError::callback_validation("missing authorization code"))?;

        let response = self
            .endpoint
            .exchange_code(&code, &flow.redirect_uri, &flow.code_verifier)
            .await?;

        let mut cache = self.cache.lock().await;
        let credential = self.credential_from_exchange(response, cache.as_ref());
        self.store.save(&credential)?;
        *cache = Some(credential.clone());

        info!(expiry = ?credential.expiry, "authorization completed");
        Ok(credential)
    }

    fn credential_from_exchange(
        &self,
        response: TokenResponse,
        previous: Option<&Credential>,
    ) -> Credential {
        let scopes = match response.granted_scopes() {
            Some(granted) => {
                let missing: Vec<&String> = self
                    .config
                    .scopes
                    .iter()
                    .filter(|s| !granted.contains(s))
                    .collect();
                if !missing.is_empty() {
                    warn!(?missing, "provider granted fewer scopes than requested");
                }
                granted
            }
            None => self.config.scopes.clone(),
        };

        let refresh_token = response.refresh_token.or_else(|| {
            warn!("token exchange returned no refresh token");
            previous.and_then(|c| c.refresh_token.clone())
        });

        Credential::new(
            response.access_token,
            refresh_token,
            response.expires_in,
            scopes,
            &self.config.secrets,
        )
    }

    /// Drops the cached and stored credential.
    pub async fn invalidate(&self) -> AuthResult<()> {
        *self.cache.lock().await = None;
        self.store.clear()
    }
}

/// Generates a URL-safe CSRF state token.
pub fn generate_state() -> String {
    let bytes: [u8; STATE_LENGTH] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(bytes)
}

fn generate_code_verifier() -> String {
    let bytes: [u8; CODE_VERIFIER_LENGTH] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// S256 challenge for a PKCE verifier (RFC 7636).
fn code_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Compares two state tokens without short-circuiting on the first mismatch.
pub(crate) fn states_match(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;
    use crate::endpoint::BoxFuture;

    /// Token endpoint returning canned results.
    #[derive(Debug)]
    pub struct StubEndpoint {
        pub exchange: Mutex<Option<AuthResult<TokenResponse>>>,
        pub refresh: Mutex<Option<AuthResult<TokenResponse>>>,
        pub exchange_calls: AtomicUsize,
        pub refresh_calls: AtomicUsize,
        stall_exchange: AtomicBool,
    }

    impl StubEndpoint {
        pub fn new() -> Self {
            Self {
                exchange: Mutex::new(None),
                refresh: Mutex::new(None),
                exchange_calls: AtomicUsize::new(0),
                refresh_calls: AtomicUsize::new(0),
                stall_exchange: AtomicBool::new(false),
            }
        }

        /// Code exchanges never complete.
        pub fn stalling_exchange(self) -> Self {
            self.stall_exchange.store(true, Ordering::SeqCst);
            self
        }

        pub fn with_exchange(self, result: AuthResult<TokenResponse>) -> Self {
            *self.exchange.lock().unwrap() = Some(result);
            self
        }

        pub fn with_refresh(self, result: AuthResult<TokenResponse>) -> Self {
            *self.refresh.lock().unwrap() = Some(result);
            self
        }
    }

    fn take(slot: &Mutex<Option<AuthResult<TokenResponse>>>) -> AuthResult<TokenResponse> {
        slot.lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| Err(AuthError::network("stub has no response")))
    }

    impl TokenEndpoint for StubEndpoint {
        fn exchange_code<'a>(
            &'a self,
            _code: &'a str,
            _redirect_uri: &'a str,
            _code_verifier: &'a str,
        ) -> BoxFuture<'a, AuthResult<TokenResponse>> {
            self.exchange_calls.fetch_add(1, Ordering::SeqCst);
            if self.stall_exchange.load(Ordering::SeqCst) {
                return Box::pin(std::future::pending());
            }
            let result = take(&self.exchange);
            Box::pin(async move { result })
        }

        fn refresh<'a>(
            &'a self,
            _refresh_token: &'a str,
        ) -> BoxFuture<'a, AuthResult<TokenResponse>> {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            let result = take(&self.refresh);
            Box::pin(async move { result })
        }
    }

    pub fn token(access: &str, refresh: Option<&str>, expires_in: i64) -> TokenResponse {
        TokenResponse {
            access_token: access.to_string(),
            refresh_token: refresh.map(str::to_string),
            expires_in: Some(expires_in),
            ..Default::default()
        }
    }

    pub fn engine_with(
        dir: &std::path::Path,
        stub: StubEndpoint,
    ) -> (Arc<RefreshEngine>, Arc<StubEndpoint>) {
        let config = OAuthConfig::new(crate::ClientSecrets::new("client-id", "client-secret"))
            .with_token_path(dir.join("token.json"))
            .with_scopes(vec!["scope.calendar".to_string()]);
        let stub = Arc::new(stub);
        let engine = Arc::new(RefreshEngine::new(config, stub.clone()));
        (engine, stub)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::testing::{StubEndpoint, engine_with, token};
    use super::*;
    use crate::ClientSecrets;

    fn stored(engine: &RefreshEngine, expiry: Option<DateTime<Utc>>, refresh: Option<&str>) {
        let mut credential = Credential::new(
            "old-access",
            refresh.map(str::to_string),
            None,
            vec!["scope.calendar".to_string()],
            &ClientSecrets::new("client-id", "client-secret"),
        );
        credential.expiry = expiry;
        engine.store().save(&credential).unwrap();
    }

    fn callback_url(request: &AuthorizationRequest, query: &str) -> String {
        format!("{}?{}", request.redirect_uri, query)
    }

    #[tokio::test]
    async fn no_token_file_needs_refresh_without_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _) = engine_with(dir.path(), StubEndpoint::new());

        let status = engine.check_token_expiration(Duration::days(6)).await;
        assert_eq!(
            status,
            ExpirationStatus {
                needs_refresh: true,
                expiry: None
            }
        );
    }

    #[tokio::test]
    async fn expiration_respects_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _) = engine_with(dir.path(), StubEndpoint::new());
        let expiry = Utc::now() + Duration::hours(1);
        stored(&engine, Some(expiry), Some("refresh"));

        let status = engine.check_token_expiration(Duration::minutes(5)).await;
        assert!(!status.needs_refresh);
        assert_eq!(status.expiry, Some(expiry));

        let status = engine.check_token_expiration(Duration::hours(2)).await;
        assert!(status.needs_refresh);
    }

    #[tokio::test]
    async fn unknown_expiry_follows_policy() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _) = engine_with(dir.path(), StubEndpoint::new());
        stored(&engine, None, Some("refresh"));
        assert!(engine.check_token_expiration(Duration::zero()).await.needs_refresh);

        let config = engine
            .config()
            .clone()
            .with_refresh_when_expiry_unknown(false);
        let lenient = RefreshEngine::new(config, Arc::new(StubEndpoint::new()));
        assert!(!lenient.check_token_expiration(Duration::zero()).await.needs_refresh);
    }

    #[tokio::test]
    async fn get_credentials_returns_valid_without_network() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, stub) = engine_with(dir.path(), StubEndpoint::new());
        stored(&engine, Some(Utc::now() + Duration::hours(1)), Some("refresh"));

        let credential = engine.get_credentials().await.unwrap();
        assert_eq!(credential.access_token, "old-access");
        assert_eq!(stub.refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn get_credentials_refreshes_expired_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let stub = StubEndpoint::new().with_refresh(Ok(token("new-access", None, 3600)));
        let (engine, stub) = engine_with(dir.path(), stub);
        stored(&engine, Some(Utc::now() - Duration::minutes(1)), Some("refresh"));

        let credential = engine.get_credentials().await.unwrap();
        assert_eq!(credential.access_token, "new-access");
        assert_eq!(credential.refresh_token.as_deref(), Some("refresh"));
        assert_eq!(stub.refresh_calls.load(Ordering::SeqCst), 1);

        let on_disk = engine.store().load().unwrap();
        assert_eq!(on_disk.access_token, "new-access");
    }

    #[tokio::test]
    async fn get_credentials_expired_without_refresh_token_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, stub) = engine_with(dir.path(), StubEndpoint::new());
        stored(&engine, Some(Utc::now() - Duration::minutes(1)), None);

        assert!(engine.get_credentials().await.is_none());
        assert_eq!(stub.refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rejected_refresh_invalidates_credential() {
        let dir = tempfile::tempdir().unwrap();
        let stub =
            StubEndpoint::new().with_refresh(Err(AuthError::refresh_rejected("invalid_grant")));
        let (engine, _) = engine_with(dir.path(), stub);
        stored(&engine, Some(Utc::now() - Duration::minutes(1)), Some("refresh"));

        assert!(engine.get_credentials().await.is_none());
        assert!(!engine.store().exists());
    }

    #[tokio::test]
    async fn network_failure_keeps_credential() {
        let dir = tempfile::tempdir().unwrap();
        let stub = StubEndpoint::new().with_refresh(Err(AuthError::network("down")));
        let (engine, _) = engine_with(dir.path(), stub);
        stored(&engine, Some(Utc::now() - Duration::minutes(1)), Some("refresh"));

        let err = engine.refresh_credentials().await.unwrap_err();
        assert!(err.is_retryable());
        assert!(engine.store().exists());
    }

    #[tokio::test]
    async fn refresh_credentials_without_refresh_token_requires_reauth() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _) = engine_with(dir.path(), StubEndpoint::new());
        stored(&engine, Some(Utc::now() + Duration::hours(1)), None);

        let err = engine.refresh_credentials().await.unwrap_err();
        assert!(err.requires_reauth());
    }

    #[test]
    fn auth_url_contains_required_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _) = engine_with(dir.path(), StubEndpoint::new());

        let request = engine
            .initiate_auth_flow("http://localhost:8080/callback")
            .unwrap();
        let url = url::Url::parse(&request.url).unwrap();
        let params: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();

        assert!(request.url.starts_with(crate::config::DEFAULT_AUTH_URI));
        assert_eq!(params["response_type"], "code");
        assert_eq!(params["client_id"], "client-id");
        assert_eq!(params["redirect_uri"], "http://localhost:8080/callback");
        assert_eq!(params["scope"], "scope.calendar");
        assert_eq!(params["access_type"], "offline");
        assert_eq!(params["prompt"], "consent");
        assert_eq!(params["state"], request.state);
        assert_eq!(params["code_challenge_method"], "S256");
        assert_eq!(params["code_challenge"].len(), 43);
        assert!(engine.has_pending_flow());
    }

    #[test]
    fn pkce_challenge_matches_rfc7636_example() {
        assert_eq!(
            code_challenge("dBjftJeZ4CVP-mJ0oxLDMVSY_l_h1JjrL1HMUeQ72eQ"),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
        let verifier = generate_code_verifier();
        assert_eq!(verifier.len(), 86);
        assert_ne!(verifier, generate_code_verifier());
    }

    #[test]
    fn states_are_random_and_long() {
        let a = generate_state();
        let b = generate_state();
        assert_ne!(a, b);
        // 32 bytes base64url without padding
        assert_eq!(a.len(), 43);
    }

    #[test]
    fn state_comparison() {
        assert!(states_match("abc123", "abc123"));
        assert!(!states_match("abc123", "abc124"));
        assert!(!states_match("abc", "abc123"));
    }

    #[tokio::test]
    async fn complete_without_initiate_fails_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _) = engine_with(dir.path(), StubEndpoint::new());

        assert!(
            !engine
                .complete_auth_flow("http://localhost:8080/callback?code=x&state=y")
                .await
        );
        let err = engine
            .try_complete_auth_flow("http://localhost:8080/callback?code=x&state=y")
            .await
            .unwrap_err();
        assert_eq!(err.code(), AuthErrorCode::NoPendingFlow);
    }

    #[tokio::test]
    async fn complete_rejects_state_mismatch_and_keeps_store() {
        let dir = tempfile::tempdir().unwrap();
        let stub = StubEndpoint::new().with_exchange(Ok(token("t1", Some("r1"), 3600)));
        let (engine, stub) = engine_with(dir.path(), stub);
        stored(&engine, Some(Utc::now() + Duration::hours(1)), Some("refresh"));

        let request = engine
            .initiate_auth_flow("http://localhost:8080/callback")
            .unwrap();
        let ok = engine
            .complete_auth_flow(&callback_url(&request, "code=XYZ&state=forged"))
            .await;

        assert!(!ok);
        assert_eq!(stub.exchange_calls.load(Ordering::SeqCst), 0);
        assert_eq!(engine.store().load().unwrap().access_token, "old-access");
        assert!(!engine.has_pending_flow());
    }

    #[tokio::test]
    async fn complete_rejects_provider_error() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _) = engine_with(dir.path(), StubEndpoint::new());

        let request = engine
            .initiate_auth_flow("http://localhost:8080/callback")
            .unwrap();
        let query = format!("error=access_denied&state={}", request.state);
        let err = engine
            .try_complete_auth_flow(&callback_url(&request, &query))
            .await
            .unwrap_err();

        assert_eq!(err.code(), AuthErrorCode::CallbackValidation);
        assert!(!engine.store().exists());
    }

    #[tokio::test]
    async fn complete_exchanges_code_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let stub = StubEndpoint::new().with_exchange(Ok(token("t1", Some("r1"), 3600)));
        let (engine, _) = engine_with(dir.path(), stub);

        let request = engine
            .initiate_auth_flow("http://localhost:8080/callback")
            .unwrap();
        let query = format!("code=XYZ&state={}", request.state);
        assert!(engine.complete_auth_flow(&callback_url(&request, &query)).await);

        let credential = engine.store().load().unwrap();
        assert_eq!(credential.access_token, "t1");
        assert_eq!(credential.refresh_token.as_deref(), Some("r1"));
        assert_eq!(credential.client_id, "client-id");
        assert_eq!(credential.scopes, vec!["scope.calendar".to_string()]);
        assert!(credential.time_until_expiry().unwrap() > Duration::minutes(59));

        let status = engine.check_token_expiration(Duration::minutes(5)).await;
        assert!(!status.needs_refresh);
    }

    #[tokio::test]
    async fn invalidate_clears_everything() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _) = engine_with(dir.path(), StubEndpoint::new());
        stored(&engine, Some(Utc::now() + Duration::hours(1)), Some("refresh"));
        assert!(engine.get_credentials().await.is_some());

        engine.invalidate().await.unwrap();
        assert!(engine.get_credentials().await.is_none());
        assert!(!engine.store().exists());
    }
    #[tokio::test]
    async fn rate_limited_refresh_keeps_stored_credential() {
        use axum::Router;
        use axum::http::StatusCode;
        use axum::routing::post;

        let app = Router::new().route(
            "/token",
            post(|| async {
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    r#"{"error": "rate_limit_exceeded"}"#,
                )
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });

        let dir = tempfile::tempdir().unwrap();
        let secrets = ClientSecrets::new("client-id", "client-secret")
            .with_token_uri(format!("http://{}/token", addr));
        let config = OAuthConfig::new(secrets)
            .with_token_path(dir.path().join("token.json"))
            .with_scopes(vec!["scope.calendar".to_string()]);
        let engine = RefreshEngine::from_config(config).unwrap();
        stored(&engine, Some(Utc::now() - Duration::minutes(1)), Some("refresh"));

        let err = engine.refresh_credentials().await.unwrap_err();
        assert_eq!(err.code(), AuthErrorCode::NetworkError);
        assert!(engine.store().exists());
        assert_eq!(
            engine.store().load().unwrap().refresh_token.as_deref(),
            Some("refresh")
        );
    }
}
