//! Core type definitions for the store.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a transaction.
///
/// Transaction IDs are monotonically increasing and never reused. They
/// also identify the owner of advisory locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// Creates a new transaction ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}

/// Sequence number for ordering commits.
///
/// A transaction reads the versions committed at or before its snapshot
/// sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SequenceNumber(pub u64);

impl SequenceNumber {
    /// Creates a new sequence number.
    #[must_use]
    pub const fn new(seq: u64) -> Self {
        Self(seq)
    }

    /// Returns the raw sequence value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seq:{}", self.0)
    }
}

/// Key of a live record or lookup entry: `(record_type, record_id)`.
pub type RecordKey = (String, String);

/// Namespace of an advisory lock key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockSpace {
    /// Server-wide singletons such as the session-creation lock.
    Global,
    /// Per-session keys.
    Session,
    /// Writers registered against the tick they commit with.
    PendingEdit,
}

/// Key of an advisory lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LockKey {
    /// Namespace of the key.
    pub space: LockSpace,
    /// Integer key within the namespace.
    pub id: i64,
}

impl LockKey {
    /// Creates a server-wide key.
    pub const fn global(id: i64) -> Self {
        Self {
            space: LockSpace::Global,
            id,
        }
    }

    /// Creates a per-session key from a hashed session id.
    pub const fn session(id: i64) -> Self {
        Self {
            space: LockSpace::Session,
            id,
        }
    }

    /// Creates the pending-edit key for a tick.
    pub const fn pending_edit(tick: i64) -> Self {
        Self {
            space: LockSpace::PendingEdit,
            id: tick,
        }
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{}", self.space, self.id)
    }
}

/// Lock acquisition mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Many holders at once, excluded by an exclusive holder.
    Shared,
    /// A single holder.
    Exclusive,
}
