//! Error types for the token lifecycle.
//!
//! Every failure in this crate degrades to "no valid credential yet". The
//! [`AuthErrorCode`] tells the caller which recovery path applies: a forced
//! reauthorization, a retry on the next monitoring cycle, or nothing at all
//! (for failures that only affect a single authorization attempt).

use std::fmt;
use thiserror::Error;

/// The category of an authorization error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthErrorCode {
    /// Client secrets are missing or unreadable.
    ConfigurationError,
    /// No token file exists.
    TokenNotFound,
    /// The token file exists but could not be parsed.
    TokenMalformed,
    /// The provider rejected the refresh token (e.g. `invalid_grant`).
    RefreshRejected,
    /// Network error talking to the token endpoint.
    NetworkError,
    /// The token endpoint answered with something we could not parse.
    InvalidResponse,
    /// A callback request failed validation (state, code or provider error).
    CallbackValidation,
    /// `complete_auth_flow` was called without a pending flow.
    NoPendingFlow,
    /// Nobody completed the authorization in time.
    Timeout,
    /// Unexpected internal state.
    InternalError,
}

impl AuthErrorCode {
    /// Returns true if the operation may succeed on a later attempt without
    /// any human involvement.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NetworkError | Self::Timeout)
    }

    /// Returns true if the error means the stored credential is unusable and
    /// a full reauthorization is required.
    pub fn requires_reauth(&self) -> bool {
        matches!(
            self,
            Self::TokenNotFound | Self::TokenMalformed | Self::RefreshRejected
        )
    }

    /// Returns a machine-readable name for this error code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConfigurationError => "configuration_error",
            Self::TokenNotFound => "token_not_found",
            Self::TokenMalformed => "token_malformed",
            Self::RefreshRejected => "refresh_rejected",
            Self::NetworkError => "network_error",
            Self::InvalidResponse => "invalid_response",
            Self::CallbackValidation => "callback_validation",
            Self::NoPendingFlow => "no_pending_flow",
            Self::Timeout => "timeout",
            Self::InternalError => "internal_error",
        }
    }
}

impl fmt::Display for AuthErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An error raised while loading, refreshing or obtaining a credential.
#[derive(Debug, Error)]
pub struct AuthError {
    code: AuthErrorCode,
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl AuthError {
    /// Creates a new error with the given code and message.
    pub fn new(code: AuthErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
        }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(AuthErrorCode::ConfigurationError, message)
    }

    /// Creates a token-not-found error.
    pub fn token_not_found(message: impl Into<String>) -> Self {
        Self::new(AuthErrorCode::TokenNotFound, message)
    }

    /// Creates a malformed-token error.
    pub fn token_malformed(message: impl Into<String>) -> Self {
        Self::new(AuthErrorCode::TokenMalformed, message)
    }

    /// Creates a refresh-rejected error.
    pub fn refresh_rejected(message: impl Into<String>) -> Self {
        Self::new(AuthErrorCode::RefreshRejected, message)
    }

    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(AuthErrorCode::NetworkError, message)
    }

    /// Creates an invalid response error.
    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::new(AuthErrorCode::InvalidResponse, message)
    }

    /// Creates a callback validation error.
    pub fn callback_validation(message: impl Into<String>) -> Self {
        Self::new(AuthErrorCode::CallbackValidation, message)
    }

    /// Creates a no-pending-flow error.
    pub fn no_pending_flow() -> Self {
        Self::new(
            AuthErrorCode::NoPendingFlow,
            "no authorization flow in progress",
        )
    }

    /// Creates a timeout error.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(AuthErrorCode::Timeout, message)
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(AuthErrorCode::InternalError, message)
    }

    /// Sets the source error for this error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Returns the error code.
    pub fn code(&self) -> AuthErrorCode {
        self.code
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns true if this error is transient.
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// Returns true if this error forces a full reauthorization.
    pub fn requires_reauth(&self) -> bool {
        self.code.requires_reauth()
    }
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// A specialized Result type for authorization operations.
pub type AuthResult<T> = Result<T, AuthError>;
