//! Error types for strest-client.

use std::time::Duration;

use thiserror::Error;

/// Main error type for all strest operations.
#[derive(Debug, Error)]
pub enum StrestError {
    /// Dialing the server failed or timed out.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The connection is not (or no longer) in the connected state.
    #[error("not connected to {0}")]
    NotConnected(String),

    /// The in-flight bound stayed exceeded for longer than the admission timeout.
    ///
    /// The connection that produced this error has been closed.
    #[error("max in-flight sustained for more than {0:?}, connection closed")]
    Backpressure(Duration),

    /// The connection was torn down while the transaction was still pending.
    #[error("connection to {0} is closed")]
    ConnectionClosed(String),

    /// I/O error while reading from or writing to the stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Protocol error (malformed or oversized message).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A synchronous call did not complete before its deadline.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The client has been closed.
    #[error("client is closed")]
    ClientClosed,
}

impl StrestError {
    /// Whether retrying the same call later could succeed.
    ///
    /// Connection-level failures are healed by the client's reconnect loop;
    /// encoding and protocol errors are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StrestError::Connect { .. }
                | StrestError::NotConnected(_)
                | StrestError::Backpressure(_)
                | StrestError::ConnectionClosed(_)
                | StrestError::Io(_)
                | StrestError::Timeout(_)
        )
    }
}

/// Result type alias using StrestError.
pub type Result<T> = std::result::Result<T, StrestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = StrestError::NotConnected("127.0.0.1:8009".to_string());
        assert_eq!(err.to_string(), "not connected to 127.0.0.1:8009");

        let err = StrestError::Timeout(Duration::from_millis(50));
        assert_eq!(err.to_string(), "request timed out after 50ms");
    }

    #[test]
    fn test_retryable() {
        assert!(StrestError::ConnectionClosed("a".into()).is_retryable());
        assert!(StrestError::Backpressure(Duration::from_secs(1)).is_retryable());
        assert!(!StrestError::Protocol("bad".into()).is_retryable());
        assert!(!StrestError::ClientClosed.is_retryable());
    }

    #[test]
    fn test_connect_error_source() {
        use std::error::Error as _;

        let err = StrestError::Connect {
            addr: "localhost:1".into(),
            source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
        };
        assert!(err.source().is_some());
        assert!(err.to_string().contains("localhost:1"));
    }
}
