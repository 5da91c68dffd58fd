//! Error types for the sync client.

use serde_json::Value;
use thiserror::Error;
use ticksync_protocol::ProtocolError;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors that can occur while a client syncs.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The server answered with an error status.
    #[error("server error ({status}): {message}")]
    Server {
        /// HTTP-style status code.
        status: u16,
        /// Message reported by the server.
        message: String,
        /// Whether the server marked the failure retryable.
        retryable: bool,
    },

    /// Malformed stream framing.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A response body did not have the expected shape.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The device never reached the front of the queue.
    #[error("not admitted after {attempts} attempts")]
    NotAdmitted {
        /// Admission attempts made.
        attempts: u32,
    },

    /// A server-side phase did not finish in time.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// A stream ended without its terminating message.
    #[error("stream closed before its end message")]
    StreamClosed,

    /// Local state could not be read or written.
    #[error("local store error: {0}")]
    Store(String),
}

impl ClientError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Builds the error for a non-success response body of the form
    /// `{"error": {"message": ..., "retryable": ...}}`.
    pub fn from_response(status: u16, body: &Value) -> Self {
        let error = &body["error"];
        Self::Server {
            status,
            message: error["message"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| body.to_string()),
            retryable: error["retryable"].as_bool().unwrap_or(status >= 500),
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Transport { retryable, .. } => *retryable,
            ClientError::Server { retryable, .. } => *retryable,
            ClientError::NotAdmitted { .. } | ClientError::Timeout(_) => true,
            _ => false,
        }
    }

    /// Returns true if the server already considers the session over, so
    /// there is no point reporting the failure back to it.
    pub fn ends_session(&self) -> bool {
        matches!(self, ClientError::Server { status: 404 | 409, .. })
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        ClientError::InvalidResponse(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn retryable_errors() {
        assert!(ClientError::transport_retryable("connection lost").is_retryable());
        assert!(!ClientError::transport_fatal("bad certificate").is_retryable());
        assert!(ClientError::Timeout("session ready").is_retryable());
        assert!(!ClientError::StreamClosed.is_retryable());
    }

    #[test]
    fn server_errors_keep_their_message() {
        let body = json!({"error": {"message": "Sync session 'abc' not found", "retryable": false}});
        let err = ClientError::from_response(404, &body);
        assert_eq!(
            err.to_string(),
            "server error (404): Sync session 'abc' not found"
        );
        assert!(!err.is_retryable());
        assert!(err.ends_session());

        let err = ClientError::from_response(503, &json!("down"));
        assert!(err.is_retryable());
        assert!(!err.ends_session());
    }
}
