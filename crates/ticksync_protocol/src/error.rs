//! Error types for protocol encoding and decoding.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while encoding or decoding protocol messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A message could not be serialized or parsed as JSON.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A streamed line was not valid UTF-8.
    #[error("stream line {line} is not valid utf-8")]
    InvalidUtf8 {
        /// One-based line number within the stream.
        line: usize,
    },

    /// The stream ended with a partial line still buffered.
    #[error("stream truncated with {0} unterminated bytes")]
    Truncated(usize),

    /// A message was structurally valid but semantically wrong.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}
