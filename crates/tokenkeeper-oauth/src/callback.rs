//! Loopback HTTP listener that completes one authorization attempt.
//!
//! The server binds before the flow is initiated so that an ephemeral port
//! (`port = 0`) ends up in the redirect URI, but it only starts serving once
//! the pending flow exists.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::{Query, RawQuery, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::{RefreshEngine, states_match};
use crate::error::{AuthError, AuthResult};

/// How long `stop` waits for the serving task before aborting it.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Listener configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackConfig {
    /// Interface to bind.
    pub host: String,
    /// Port to bind; `0` picks an ephemeral port.
    pub port: u16,
    /// Host advertised in the redirect URI. Defaults to `host`, or
    /// `localhost` when binding every interface.
    pub redirect_host: Option<String>,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8080,
            redirect_host: None,
        }
    }
}

impl CallbackConfig {
    /// Creates a configuration binding `host:port`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            redirect_host: None,
        }
    }

    /// Sets the host advertised in the redirect URI.
    pub fn with_redirect_host(mut self, host: impl Into<String>) -> Self {
        self.redirect_host = Some(host.into());
        self
    }

    fn advertised_host(&self) -> &str {
        match self.redirect_host.as_deref() {
            Some(host) => host,
            None if self.host == "0.0.0.0" || self.host == "::" => "localhost",
            None => &self.host,
        }
    }

    /// Returns the redirect URI for the given bound port.
    pub fn redirect_uri(&self, port: u16) -> String {
        format!("http://{}:{}/callback", self.advertised_host(), port)
    }
}

/// One authorization attempt.
#[derive(Debug)]
pub struct AuthSession {
    state: String,
    authorization_url: String,
    claimed: AtomicBool,
    outcome: watch::Sender<Option<bool>>,
}

impl AuthSession {
    pub(crate) fn new(state: String, authorization_url: String) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            state,
            authorization_url,
            claimed: AtomicBool::new(false),
            outcome,
        }
    }

    /// Returns the CSRF state of this attempt.
    pub fn state(&self) -> &str {
        &self.state
    }

    /// Returns the consent URL of this attempt.
    pub fn authorization_url(&self) -> &str {
        &self.authorization_url
    }

    /// Returns true once a callback has been processed.
    pub fn is_completed(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    /// Returns true if the processed callback succeeded.
    pub fn succeeded(&self) -> bool {
        (*self.outcome.borrow()).unwrap_or(false)
    }

    fn outcome(&self) -> Option<bool> {
        *self.outcome.borrow()
    }

    /// Records the outcome. Only the first call has any effect.
    fn finish(&self, success: bool) {
        self.outcome.send_if_modified(|outcome| {
            if outcome.is_some() {
                return false;
            }
            *outcome = Some(success);
            true
        });
    }

    /// Waits until the session completes and returns whether it succeeded.
    async fn wait(&self) -> bool {
        let mut rx = self.outcome.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).unwrap_or(false),
            Err(_) => false,
        }
    }
}

/// Body of the `/health` route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub auth_completed: bool,
    pub auth_success: bool,
}

#[derive(Debug, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

#[derive(Clone)]
struct CallbackState {
    engine: Arc<RefreshEngine>,
    session: Arc<AuthSession>,
    redirect_uri: Arc<str>,
}

/// Builds the router serving one session.
pub fn build_router(
    engine: Arc<RefreshEngine>,
    session: Arc<AuthSession>,
    redirect_uri: impl Into<String>,
) -> Router {
    let state = CallbackState {
        engine,
        session,
        redirect_uri: Arc::from(redirect_uri.into()),
    };

    Router::new()
        .route("/callback", get(handle_callback))
        .route("/health", get(handle_health))
        .with_state(state)
}

async fn handle_health(State(state): State<CallbackState>) -> axum::Json<HealthResponse> {
    axum::Json(HealthResponse {
        status: "ok".to_string(),
        auth_completed: state.session.is_completed(),
        auth_success: state.session.succeeded(),
    })
}

async fn handle_callback(
    State(state): State<CallbackState>,
    Query(params): Query<CallbackParams>,
    RawQuery(raw): RawQuery,
) -> Response {
    let session = &state.session;

    if let Some(success) = session.outcome() {
        debug!(success, "callback replayed for completed session");
        return replay(success);
    }

    // Concurrent duplicates wait for the first request's outcome.
    if session.claimed.swap(true, Ordering::SeqCst) {
        return replay(session.wait().await);
    }
    let _claim = ClaimGuard(session);

    if let Some(err) = params.error.as_deref() {
        warn!(error = err, "provider returned an authorization error");
        session.finish(false);
        return page(
            StatusCode::BAD_REQUEST,
            "Authorization Failed",
            "The provider denied the authorization request.",
        );
    }

    if !params
        .state
        .as_deref()
        .is_some_and(|s| states_match(s, session.state()))
    {
        warn!("callback state mismatch");
        session.finish(false);
        return page(
            StatusCode::BAD_REQUEST,
            "Authorization Failed",
            "The request did not match the pending authorization.",
        );
    }

    if params.code.as_deref().is_none_or(str::is_empty) {
        warn!("callback without authorization code");
        session.finish(false);
        return page(
            StatusCode::BAD_REQUEST,
            "Authorization Failed",
            "No authorization code was received.",
        );
    }

    let callback_url = format!("{}?{}", state.redirect_uri, raw.unwrap_or_default());
    let success = state.engine.complete_auth_flow(&callback_url).await;
    session.finish(success);

    if success {
        info!("authorization callback completed");
        success_page()
    } else {
        page(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Authorization Failed",
            "The authorization code could not be exchanged.",
        )
    }
}

/// Fails the session if the claiming request is dropped before it finishes.
struct ClaimGuard<'a>(&'a AuthSession);

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        if !self.0.is_completed() {
            warn!("callback request dropped before completing");
            self.0.finish(false);
        }
    }
}

fn replay(success: bool) -> Response {
    if success {
        success_page()
    } else {
        page(
            StatusCode::BAD_REQUEST,
            "Authorization Failed",
            "This authorization attempt has already failed.",
        )
    }
}

fn success_page() -> Response {
    page(
        StatusCode::OK,
        "Authorization Successful",
        "You can close this window.",
    )
}

fn page(status: StatusCode, title: &str, message: &str) -> Response {
    let body = format!(
        "<html><head><title>{title}</title></head><body>\
         <h1>{title}</h1><p>{message}</p>\
         <script>setTimeout(function() {{ window.close(); }}, 3000);</script>\
         </body></html>"
    );
    (status, Html(body)).into_response()
}

struct Running {
    session: Arc<AuthSession>,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

/// Ephemeral listener for the OAuth redirect.
pub struct CallbackServer {
    config: CallbackConfig,
    engine: Arc<RefreshEngine>,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for CallbackServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackServer")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl CallbackServer {
    /// Creates a stopped server.
    pub fn new(config: CallbackConfig, engine: Arc<RefreshEngine>) -> Self {
        Self {
            config,
            engine,
            running: Mutex::new(None),
        }
    }

    /// Returns the listener configuration.
    pub fn config(&self) -> &CallbackConfig {
        &self.config
    }

    /// Binds the listener, initiates a flow and returns the consent URL.
    ///
    /// A previous session, if any, is stopped first.
    pub async fn start(&self) -> AuthResult<String> {
        self.stop().await;

        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port))
            .await
            .map_err(|e| {
                AuthError::internal(format!(
                    "failed to bind callback server on {}:{}: {}",
                    self.config.host, self.config.port, e
                ))
                .with_source(e)
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| AuthError::internal(format!("failed to read local address: {}", e)))?;

        let redirect_uri = self.config.redirect_uri(local_addr.port());
        let request = self.engine.initiate_auth_flow(&redirect_uri)?;
        let session = Arc::new(AuthSession::new(request.state, request.url.clone()));
        let router = build_router(self.engine.clone(), session.clone(), redirect_uri);

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                if let Err(e) = axum::serve(listener, router)
                    .with_graceful_shutdown(shutdown.cancelled_owned())
                    .await
                {
                    error!(error = %e, "callback server failed");
                }
            }
        });

        let mut running = self
            .running
            .lock()
            .map_err(|_| AuthError::internal("callback server lock poisoned"))?;
        *running = Some(Running {
            session,
            local_addr,
            shutdown,
            handle,
        });

        info!(%local_addr, "callback server listening");
        Ok(request.url)
    }

    /// Waits for the callback, returning whether authorization succeeded.
    ///
    /// Returns false on timeout or when the server is not running.
    pub async fn wait_for_auth(&self, timeout: Duration) -> bool {
        let Some(session) = self.session() else {
            warn!("wait_for_auth called without a running callback server");
            return false;
        };

        match tokio::time::timeout(timeout, session.wait()).await {
            Ok(success) => success,
            Err(_) => {
                warn!(timeout_secs = timeout.as_secs(), "authorization timed out");
                false
            }
        }
    }

    /// Shuts the listener down. Safe to call when not running.
    pub async fn stop(&self) {
        let running = match self.running.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        let Some(mut running) = running else {
            return;
        };

        running.shutdown.cancel();
        match tokio::time::timeout(STOP_TIMEOUT, &mut running.handle).await {
            Ok(_) => debug!(addr = %running.local_addr, "callback server stopped"),
            Err(_) => {
                warn!(addr = %running.local_addr, "callback server did not stop in time, aborting");
                running.handle.abort();
            }
        }
    }

    /// Returns the active session, if any.
    pub fn session(&self) -> Option<Arc<AuthSession>> {
        self.running
            .lock()
            .ok()
            .and_then(|guard| guard.as_ref().map(|r| r.session.clone()))
    }

    /// Returns the bound address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running
            .lock()
            .ok()
            .and_then(|guard| guard.as_ref().map(|r| r.local_addr))
    }

    /// Returns true while the listener is up.
    pub fn is_running(&self) -> bool {
        self.local_addr().is_some()
    }

    /// Tears the listener down without waiting for the serving task.
    pub fn abort(&self) {
        if let Ok(mut guard) = self.running.lock()
            && let Some(running) = guard.take()
        {
            running.shutdown.cancel();
            running.handle.abort();
            debug!(addr = %running.local_addr, "callback server aborted");
        }
    }
}

impl Drop for CallbackServer {
    fn drop(&mut self) {
        self.abort();
    }
}
