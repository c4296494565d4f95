use thiserror::Error;

/// Main error type for livelink
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RealtimeError {
    /// WebSocket transport error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// The peer refused or could not be reached
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// Connection closed unexpectedly
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// Frame could not be decoded into an envelope
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Envelope could not be encoded into a frame
    #[error("Encode error: {0}")]
    EncodeError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A listener callback reported a failure
    #[error("Listener failed: {0}")]
    ListenerFailed(String),

    /// Timeout error
    #[error("Operation timed out: {0}")]
    Timeout(String),
}

impl From<serde_json::Error> for RealtimeError {
    fn from(e: serde_json::Error) -> Self {
        RealtimeError::ParseError(e.to_string())
    }
}

/// Result type for livelink operations
pub type Result<T> = std::result::Result<T, RealtimeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_errors_become_parse_errors() {
        let err: RealtimeError = serde_json::from_str::<serde_json::Value>("{").unwrap_err().into();
        assert!(matches!(err, RealtimeError::ParseError(_)));
        assert!(err.to_string().starts_with("Parse error: "));
    }
}
