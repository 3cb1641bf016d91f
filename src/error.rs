use thiserror::Error;

/// Error types for the session server
#[derive(Debug, Error)]
pub enum SessionError {
    /// Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Persistence errors
    #[error("Failed to read persisted state: {0}")]
    StoreRead(#[source] std::io::Error),

    #[error("Failed to write persisted state: {0}")]
    StoreWrite(#[source] std::io::Error),

    #[error("Persisted state is corrupt: {0}")]
    StoreDecode(#[source] serde_json::Error),

    /// Protocol errors
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Failed to serialize message: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    /// Generic errors
    #[error("Internal server error: {0}")]
    Internal(String),
}

/// Convenience type alias for Results using SessionError
pub type Result<T> = std::result::Result<T, SessionError>;

impl SessionError {
    /// Helper to create Internal errors with context
    pub fn internal(msg: impl Into<String>) -> Self {
        SessionError::Internal(msg.into())
    }

    /// Helper to create configuration errors
    pub fn configuration(msg: impl Into<String>) -> Self {
        SessionError::InvalidConfiguration(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SessionError::configuration("PORT must be a number");
        assert_eq!(err.to_string(), "Invalid configuration: PORT must be a number");
    }

    #[test]
    fn test_error_helpers() {
        let err = SessionError::internal("Something went wrong");
        assert!(matches!(err, SessionError::Internal(_)));
    }

    #[test]
    fn test_io_error_is_wrapped() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = SessionError::StoreWrite(io);
        assert!(err.to_string().starts_with("Failed to write persisted state"));
    }
}
