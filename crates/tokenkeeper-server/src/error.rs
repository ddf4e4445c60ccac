//! Server error types.

use std::io;
use thiserror::Error;

use tokenkeeper_oauth::AuthError;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the daemon.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Token lifecycle error.
    #[error("Authorization error: {0}")]
    Auth(#[from] AuthError),

    /// A notification channel failed to deliver.
    #[error("Notification delivery via {channel} failed: {message}")]
    NotificationDelivery { channel: String, message: String },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// The monitor loop is not running.
    #[error("Monitor is not running")]
    MonitorStopped,
}

impl ServerError {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a notification delivery error.
    pub fn delivery(channel: impl Into<String>, message: impl Into<String>) -> Self {
        Self::NotificationDelivery {
            channel: channel.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_errors_convert() {
        let err: ServerError = AuthError::refresh_rejected("invalid_grant").into();
        assert!(matches!(err, ServerError::Auth(_)));
        assert!(err.to_string().contains("invalid_grant"));
    }

    #[test]
    fn delivery_error_names_channel() {
        let err = ServerError::delivery("slack", "HTTP 404");
        assert_eq!(
            err.to_string(),
            "Notification delivery via slack failed: HTTP 404"
        );
    }
}
