//! Error types for the sync engine.

use thiserror::Error;
use ticksync_protocol::ProtocolError;
use ticksync_store::StoreError;

/// Result type for sync engine operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in the sync engine.
#[derive(Error, Debug)]
pub enum SyncError {
    /// No session slot is free.
    #[error("sync capacity full: {active} of {max} sessions active")]
    CapacityFull {
        /// Sessions currently open.
        active: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Another caller holds a lock the operation needs.
    #[error("lock contended: {0}")]
    LockContended(String),

    /// The session id is unknown.
    #[error("Sync session '{0}' not found")]
    SessionNotFound(String),

    /// The session carries a recorded error.
    #[error("Sync session '{session_id}' encountered an error: {message}")]
    SessionErrored {
        /// Session id.
        session_id: String,
        /// Most recent recorded error.
        message: String,
    },

    /// The session already completed.
    #[error("Sync session '{0}' is already completed")]
    SessionCompleted(String),

    /// The session exceeded its allowed age.
    #[error("Sync session {0} timed out")]
    SessionTimedOut(String),

    /// The snapshot transaction exceeded its allowed duration.
    #[error("Snapshot for session {0} timed out")]
    SnapshotTimedOut(String),

    /// A snapshot for the session was already started.
    #[error("Snapshot for session {0} is already being processed")]
    SnapshotInProgress(String),

    /// The lookup table strategy is on but the table was never built.
    #[error("Sync lookup table has not yet built. Cannot initiate sync.")]
    LookupNotBuilt,

    /// A pushed change names a type the server does not know.
    #[error("Sync security violation: unknown record type '{record_type}' (record {record_id})")]
    UnknownModel {
        /// Offending record type.
        record_type: String,
        /// Offending record id.
        record_id: String,
    },

    /// A pushed change targets a type that clients may not push.
    #[error("Sync security violation: record type '{record_type}' may not be pushed (record {record_id})")]
    DisallowedPush {
        /// Offending record type.
        record_type: String,
        /// Offending record id.
        record_id: String,
    },

    /// Request could not be understood.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A model hook failed.
    #[error("hook for '{record_type}' failed: {message}")]
    Hook {
        /// Record type whose hook failed.
        record_type: String,
        /// Failure description.
        message: String,
    },

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Internal engine error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Creates a hook failure.
    pub fn hook(record_type: impl Into<String>, message: impl Into<String>) -> Self {
        SyncError::Hook {
            record_type: record_type.into(),
            message: message.into(),
        }
    }

    /// Returns true if the client should simply retry admission.
    pub fn is_admission_error(&self) -> bool {
        matches!(
            self,
            SyncError::CapacityFull { .. } | SyncError::LockContended(_)
        )
    }

    /// Returns true if the session is unusable because of its recorded state.
    pub fn is_session_state_error(&self) -> bool {
        matches!(
            self,
            SyncError::SessionNotFound(_)
                | SyncError::SessionErrored { .. }
                | SyncError::SessionCompleted(_)
                | SyncError::SessionTimedOut(_)
        )
    }

    /// Returns true for rejected pushes.
    pub fn is_security_violation(&self) -> bool {
        matches!(
            self,
            SyncError::UnknownModel { .. } | SyncError::DisallowedPush { .. }
        )
    }

    /// Returns true for timeouts.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            SyncError::SessionTimedOut(_) | SyncError::SnapshotTimedOut(_)
        )
    }

    /// Returns true if the client may retry the same call later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::SnapshotInProgress(_) | SyncError::LookupNotBuilt
        ) || self.is_admission_error()
    }

    /// Returns true if this is a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        self.is_session_state_error()
            || self.is_admission_error()
            || self.is_security_violation()
            || matches!(
                self,
                SyncError::InvalidRequest(_)
                    | SyncError::Protocol(_)
                    | SyncError::SnapshotInProgress(_)
            )
    }

    /// Returns true if this is a server error (5xx).
    pub fn is_server_error(&self) -> bool {
        !self.is_client_error()
    }

    /// HTTP-style status code for the error.
    pub fn status_code(&self) -> u16 {
        match self {
            SyncError::SessionNotFound(_) => 404,
            SyncError::SnapshotInProgress(_) => 409,
            e if e.is_admission_error() => 429,
            SyncError::SessionCompleted(_) => 409,
            e if e.is_security_violation() => 403,
            e if e.is_client_error() => 400,
            SyncError::LookupNotBuilt => 503,
            _ => 500,
        }
    }
}
