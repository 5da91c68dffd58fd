//! Cross-process mutual exclusion built on transaction-scoped advisory locks.
//!
//! "Is this session being processed?" is answered by whether its advisory
//! lock is held, never by a flag on the session row. A lock dies with its
//! transaction, so a crashed worker can never leave a session stuck.

use crate::error::SyncResult;
use sha2::{Digest, Sha256};
use ticksync_store::{Database, LockKey, LockMode, Transaction};
use tracing::debug;

/// Global lock serializing session creation.
pub const SESSION_CREATION_LOCK: LockKey = LockKey::global(1);

/// Global lock serializing lookup table refreshes.
pub const LOOKUP_REFRESH_LOCK: LockKey = LockKey::global(2);

/// Maps a session id onto the integer key space of advisory locks.
///
/// The mapping is stable across processes and restarts.
pub fn session_lock_key(session_id: &str) -> LockKey {
    let digest = Sha256::digest(session_id.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    LockKey::session(i64::from_be_bytes(bytes))
}

/// Proof that the holder is processing a session.
///
/// The lock is released by [`release`](Self::release) or when the marker
/// is dropped, whichever comes first.
pub struct ProcessingMarker {
    session_id: String,
    txn: Transaction,
}

impl ProcessingMarker {
    /// Session being processed.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Releases the lock.
    pub fn release(mut self) {
        if self.txn.commit().is_err() {
            self.txn.rollback();
        }
        debug!(session_id = %self.session_id, "processing marker released");
    }
}

/// Holder of a global lock for as long as it lives.
pub struct GlobalLockGuard {
    key: LockKey,
    _txn: Transaction,
}

impl GlobalLockGuard {
    /// The key held.
    pub fn key(&self) -> LockKey {
        self.key
    }
}

/// Mutual exclusion over sessions and global operations.
#[derive(Clone)]
pub struct SyncLocks {
    db: Database,
}

impl SyncLocks {
    /// Creates the lock layer over `db`.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Marks a session as being processed.
    ///
    /// Returns `None` without blocking if another holder is already
    /// processing it.
    pub fn mark_processing(&self, session_id: &str) -> SyncResult<Option<ProcessingMarker>> {
        let txn = self.db.begin();
        if !txn.try_lock(session_lock_key(session_id), LockMode::Exclusive)? {
            return Ok(None);
        }
        debug!(session_id, "processing marker acquired");
        Ok(Some(ProcessingMarker {
            session_id: session_id.to_string(),
            txn,
        }))
    }

    /// Returns true if some holder is processing the session.
    pub fn is_processing(&self, session_id: &str) -> bool {
        !self.db.is_lock_free(session_lock_key(session_id))
    }

    /// Attempts to take a global lock without blocking.
    pub fn try_global(&self, key: LockKey) -> SyncResult<Option<GlobalLockGuard>> {
        let txn = self.db.begin();
        if !txn.try_lock(key, LockMode::Exclusive)? {
            return Ok(None);
        }
        Ok(Some(GlobalLockGuard { key, _txn: txn }))
    }
}
