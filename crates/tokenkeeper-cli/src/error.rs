//! CLI error types.

use std::fmt;

/// Result type for CLI operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors reported to the user.
#[derive(Debug)]
pub enum ClientError {
    /// Configuration is missing or invalid.
    Config(String),
    /// Token lifecycle error.
    Auth(String),
    /// No valid credential could be obtained.
    NoCredential(String),
    /// Notification channel could not be set up.
    Notification(String),
    /// Logging could not be initialized.
    Logging(String),
    /// IO error.
    Io(std::io::Error),
}

impl ClientError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) => 2,
            Self::NoCredential(_) => 3,
            _ => 1,
        }
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {}", msg),
            Self::Auth(msg) => write!(f, "authorization error: {}", msg),
            Self::NoCredential(msg) => write!(f, "no valid credential: {}", msg),
            Self::Notification(msg) => write!(f, "notification error: {}", msg),
            Self::Logging(msg) => write!(f, "logging error: {}", msg),
            Self::Io(err) => write!(f, "IO error: {}", err),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<tokenkeeper_oauth::AuthError> for ClientError {
    fn from(err: tokenkeeper_oauth::AuthError) -> Self {
        match err.code() {
            tokenkeeper_oauth::AuthErrorCode::ConfigurationError => Self::Config(err.to_string()),
            _ => Self::Auth(err.to_string()),
        }
    }
}

impl From<tokenkeeper_server::ServerError> for ClientError {
    fn from(err: tokenkeeper_server::ServerError) -> Self {
        use tokenkeeper_server::ServerError;
        match err {
            ServerError::Config { message } => Self::Config(message),
            ServerError::Auth(e) => e.into(),
            ServerError::NotificationDelivery { .. } => Self::Notification(err.to_string()),
            ServerError::Io(e) => Self::Io(e),
            other => Self::Auth(other.to_string()),
        }
    }
}
