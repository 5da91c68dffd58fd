//! # TickSync Store
//!
//! Embedded, in-process store backing the central sync server.
//!
//! This crate provides:
//! - Snapshot-isolated (repeatable read) transactions over multi-version tables
//! - Transaction-scoped advisory locks in shared and exclusive mode
//! - An atomic integer fact used as the global sync clock, with pending-edit
//!   registration for writers stamped with the current tick
//! - Session-keyed snapshot partitions with a unique outgoing key
//! - Autocommit system tables (sessions, device queue, debug logs)
//! - JSON checkpoints of the latest committed state
//!
//! ## Concurrency
//!
//! Writers buffer their changes and apply them under a short commit lock;
//! there is no writer lock held for a transaction's lifetime. Concurrent
//! writes to the same row resolve as last-committer-wins.
//!
//! Callbacks passed to the `scan_*` methods run while table state is being
//! read and must not call back into the store.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod checkpoint;
mod database;
mod error;
mod locks;
mod mvcc;
mod rows;
mod transaction;
mod types;

pub use checkpoint::CheckpointStats;
pub use database::{CounterGuard, Database, StoreOptions, CURRENT_SYNC_TICK, INITIAL_SYNC_TICK};
pub use error::{StoreError, StoreResult};
pub use locks::AdvisoryLocks;
pub use rows::{
    DebugLog, DeviceTick, LookupEntry, LookupTick, NewSnapshotRow, QueuedDevice, Record,
    SessionParameters, SessionPhase, SnapshotRow, SyncSession,
};
pub use transaction::{Transaction, TransactionState};
pub use types::{LockKey, LockMode, LockSpace, RecordKey, SequenceNumber, TransactionId};
