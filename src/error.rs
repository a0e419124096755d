//! Error types for the Tollgate service.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors returned by the coordination backend
    #[error("Coordination backend error: {0}")]
    Backend(#[from] redis::RedisError),

    /// The coordination backend did not answer in time
    #[error("Coordination backend timed out after {0:?}")]
    Timeout(Duration),

    /// The coordination backend is unreachable or refused the call
    #[error("Coordination backend unavailable: {0}")]
    Unavailable(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TollgateError {
    /// Whether this error came from the coordination backend rather than
    /// from local setup.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TollgateError::Backend(_) | TollgateError::Timeout(_) | TollgateError::Unavailable(_)
        )
    }
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(TollgateError::Timeout(Duration::from_secs(3)).is_transient());
        assert!(TollgateError::Unavailable("down".to_string()).is_transient());
        assert!(!TollgateError::Config("bad".to_string()).is_transient());
    }

    #[test]
    fn test_timeout_message() {
        let err = TollgateError::Timeout(Duration::from_millis(250));
        assert_eq!(err.to_string(), "Coordination backend timed out after 250ms");
    }
}
