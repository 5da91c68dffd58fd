//! Local state of a syncing device.

use crate::error::ClientResult;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use ticksync_protocol::{RecordData, SyncChange, SyncRecord};

/// Where a client keeps its records, its outbox and its sync cursor.
pub trait ClientStore: Send + Sync {
    /// Tick the last completed pull reached.
    fn last_synced_tick(&self) -> ClientResult<i64>;

    /// Records the tick a completed pull reached.
    fn set_last_synced_tick(&self, tick: i64) -> ClientResult<()>;

    /// Local changes not yet acknowledged by the center, oldest first.
    fn pending_changes(&self) -> ClientResult<Vec<SyncChange>>;

    /// Drops the first `count` pending changes once the center persisted them.
    fn acknowledge_pushed(&self, count: usize) -> ClientResult<()>;

    /// Forgets every local record of `tables` ahead of a full resync.
    fn reset_tables(&self, tables: &[String]) -> ClientResult<()>;

    /// Applies pulled records, central state winning.
    fn apply_pulled(&self, records: &[SyncRecord]) -> ClientResult<()>;
}

/// A record as the device holds it.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalRecord {
    /// Column data.
    pub data: RecordData,
    /// Soft-delete flag.
    pub is_deleted: bool,
    /// Central tick the record was pulled at; `None` for local edits.
    pub saved_at_sync_tick: Option<i64>,
}

#[derive(Debug, Default)]
struct MemoryState {
    records: BTreeMap<(String, String), LocalRecord>,
    pending: Vec<SyncChange>,
    last_synced_tick: i64,
}

/// An in-memory client store.
#[derive(Debug, Default)]
pub struct MemoryClientStore {
    state: RwLock<MemoryState>,
}

impl MemoryClientStore {
    /// Creates an empty store that has never synced.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes a local edit and queues it for the next push.
    pub fn write(&self, change: SyncChange) {
        let mut state = self.state.write();
        let key = (change.record_type.clone(), change.record_id.clone());
        let data = if change.is_deleted {
            state
                .records
                .get(&key)
                .map(|r| r.data.clone())
                .unwrap_or_default()
        } else {
            change.data.clone()
        };
        state.records.insert(
            key,
            LocalRecord {
                data,
                is_deleted: change.is_deleted,
                saved_at_sync_tick: None,
            },
        );
        state.pending.push(change);
    }

    /// Reads a local record.
    pub fn get(&self, record_type: &str, record_id: &str) -> Option<LocalRecord> {
        self.state
            .read()
            .records
            .get(&(record_type.to_string(), record_id.to_string()))
            .cloned()
    }

    /// Ids of the live records of `record_type`, sorted.
    pub fn ids(&self, record_type: &str) -> Vec<String> {
        self.state
            .read()
            .records
            .iter()
            .filter(|((t, _), r)| t == record_type && !r.is_deleted)
            .map(|((_, id), _)| id.clone())
            .collect()
    }

    /// Number of records held, deleted ones included.
    pub fn len(&self) -> usize {
        self.state.read().records.len()
    }

    /// Returns true if no records are held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of queued local changes.
    pub fn pending_len(&self) -> usize {
        self.state.read().pending.len()
    }
}

impl ClientStore for MemoryClientStore {
    fn last_synced_tick(&self) -> ClientResult<i64> {
        Ok(self.state.read().last_synced_tick)
    }

    fn set_last_synced_tick(&self, tick: i64) -> ClientResult<()> {
        self.state.write().last_synced_tick = tick;
        Ok(())
    }

    fn pending_changes(&self) -> ClientResult<Vec<SyncChange>> {
        Ok(self.state.read().pending.clone())
    }

    fn acknowledge_pushed(&self, count: usize) -> ClientResult<()> {
        let mut state = self.state.write();
        let count = count.min(state.pending.len());
        state.pending.drain(..count);
        Ok(())
    }

    fn reset_tables(&self, tables: &[String]) -> ClientResult<()> {
        self.state
            .write()
            .records
            .retain(|(record_type, _), _| !tables.contains(record_type));
        Ok(())
    }

    fn apply_pulled(&self, records: &[SyncRecord]) -> ClientResult<()> {
        let mut state = self.state.write();
        for record in records {
            state.records.insert(
                (record.record_type.clone(), record.record_id.clone()),
                LocalRecord {
                    data: record.data.clone(),
                    is_deleted: record.is_deleted,
                    saved_at_sync_tick: Some(record.saved_at_sync_tick),
                },
            );
        }
        Ok(())
    }
}
