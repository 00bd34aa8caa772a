//! Error types for savesync core operations.
//!
//! Errors are descriptive inside the crate. The public store and service
//! boundaries swallow them into `bool` / `Option` results plus a log line,
//! so gameplay code never has to handle a persistence failure.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for savesync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Core error type for savesync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Local medium failure (quota exceeded, storage disabled, poisoned lock)
    #[error("Storage error: {0}")]
    Storage(String),

    /// SQLite-specific storage error
    #[error("SQLite error: {source}")]
    Sqlite {
        #[from]
        source: rusqlite::Error,
    },

    /// JSON serialization/deserialization error
    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    /// I/O error
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Remote backend answered with a non-success status
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// Remote backend could not be reached
    #[error("Transport error: {0}")]
    Transport(String),

    /// A remote operation was attempted without an active session
    #[error("Not signed in")]
    NotSignedIn,

    /// Identity provider refused or failed to issue a token
    #[error("Sign-in denied: {0}")]
    AuthDenied(String),

    /// A bounded operation did not finish in time
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Configuration could not be read or parsed
    #[error("Config error: {0}")]
    Config(String),

    /// Invalid caller input
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => SyncError::Http {
                status: status.as_u16(),
                message: err.to_string(),
            },
            None => SyncError::Transport(err.to_string()),
        }
    }
}

impl SyncError {
    /// True for failures worth trying again later (network, 5xx, timeouts).
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Transport(_) | SyncError::Timeout(_) => true,
            SyncError::Http { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(SyncError::Transport("reset".to_string()).is_transient());
        assert!(SyncError::Timeout(Duration::from_secs(5)).is_transient());
        assert!(SyncError::Http {
            status: 503,
            message: "unavailable".to_string()
        }
        .is_transient());
        assert!(!SyncError::Http {
            status: 404,
            message: "missing".to_string()
        }
        .is_transient());
        assert!(!SyncError::NotSignedIn.is_transient());
    }

    #[test]
    fn test_display_messages() {
        let err = SyncError::Http {
            status: 401,
            message: "bad token".to_string(),
        };
        assert_eq!(err.to_string(), "HTTP 401: bad token");
        assert_eq!(
            SyncError::Timeout(Duration::from_millis(5000)).to_string(),
            "Timed out after 5s"
        );
    }
}
