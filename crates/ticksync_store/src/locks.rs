//! Transaction-scoped advisory locks.
//!
//! Locks are owned by a transaction id and are all released together when
//! the owning transaction commits, rolls back, or is dropped. Acquisition
//! is reentrant for the owner, and an exclusive request by a shared holder
//! succeeds only when it is the sole holder.

use crate::types::{LockKey, LockMode, LockSpace, TransactionId};
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct LockState {
    exclusive: Option<(TransactionId, usize)>,
    shared: HashMap<TransactionId, usize>,
}

impl LockState {
    fn is_free(&self) -> bool {
        self.exclusive.is_none() && self.shared.is_empty()
    }

    fn can_grant(&self, owner: TransactionId, mode: LockMode) -> bool {
        let exclusive_ok = match self.exclusive {
            None => true,
            Some((holder, _)) => holder == owner,
        };
        match mode {
            LockMode::Shared => exclusive_ok,
            LockMode::Exclusive => {
                exclusive_ok && self.shared.keys().all(|holder| *holder == owner)
            }
        }
    }

    fn grant(&mut self, owner: TransactionId, mode: LockMode) {
        match mode {
            LockMode::Shared => *self.shared.entry(owner).or_insert(0) += 1,
            LockMode::Exclusive => match &mut self.exclusive {
                Some((_, count)) => *count += 1,
                None => self.exclusive = Some((owner, 1)),
            },
        }
    }
}

/// Table of advisory locks shared by every transaction of a database.
#[derive(Debug, Default)]
pub struct AdvisoryLocks {
    table: Mutex<HashMap<LockKey, LockState>>,
    released: Notify,
}

impl AdvisoryLocks {
    /// Creates an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts to take `key` without waiting.
    pub fn try_acquire(&self, key: LockKey, owner: TransactionId, mode: LockMode) -> bool {
        let mut table = self.table.lock();
        let state = table.entry(key).or_default();
        if state.can_grant(owner, mode) {
            state.grant(owner, mode);
            true
        } else {
            if state.is_free() {
                table.remove(&key);
            }
            false
        }
    }

    /// Takes `key`, waiting until it is available.
    pub async fn acquire(&self, key: LockKey, owner: TransactionId, mode: LockMode) {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            // Register interest before checking so a release in between is not lost.
            notified.as_mut().enable();
            if self.try_acquire(key, owner, mode) {
                return;
            }
            notified.await;
        }
    }

    /// Registers a shared hold without checking for an exclusive holder.
    ///
    /// Used for pending-edit registration, where the caller already holds
    /// the clock and exclusive waiters only ever target older ticks.
    pub fn register_shared(&self, key: LockKey, owner: TransactionId) {
        self.table
            .lock()
            .entry(key)
            .or_default()
            .grant(owner, LockMode::Shared);
    }

    /// Releases every lock held by `owner` and wakes waiters.
    pub fn release_all(&self, owner: TransactionId) {
        let mut released = false;
        {
            let mut table = self.table.lock();
            table.retain(|_, state| {
                if matches!(state.exclusive, Some((holder, _)) if holder == owner) {
                    state.exclusive = None;
                    released = true;
                }
                if state.shared.remove(&owner).is_some() {
                    released = true;
                }
                !state.is_free()
            });
        }
        if released {
            self.released.notify_waiters();
        }
    }

    /// Returns true if nobody holds `key` in any mode.
    pub fn is_free(&self, key: LockKey) -> bool {
        self.table
            .lock()
            .get(&key)
            .map_or(true, LockState::is_free)
    }

    /// Returns every held key in `space`, sorted.
    pub fn held_keys(&self, space: LockSpace) -> Vec<LockKey> {
        let mut keys: Vec<LockKey> = self
            .table
            .lock()
            .iter()
            .filter(|(key, state)| key.space == space && !state.is_free())
            .map(|(key, _)| *key)
            .collect();
        keys.sort();
        keys
    }

    /// Number of keys currently held, for diagnostics.
    pub fn held_count(&self) -> usize {
        self.table.lock().len()
    }
}
