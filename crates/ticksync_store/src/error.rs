//! Error types for store operations.

use crate::types::TransactionId;
use std::io;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The transaction was already committed or rolled back.
    #[error("transaction {0} is no longer active")]
    TransactionClosed(TransactionId),

    /// A fact held a value that is not of the expected type.
    #[error("fact {key} holds a non-integer value: {value}")]
    InvalidFact {
        /// Fact key.
        key: String,
        /// Stored value.
        value: String,
    },

    /// A row required by the operation does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A checkpoint could not be encoded or decoded.
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] serde_json::Error),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
