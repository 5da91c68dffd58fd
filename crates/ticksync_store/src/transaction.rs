//! Snapshot-isolated transactions.

use crate::database::{ChangelogKey, DatabaseInner, SnapshotIndexKey, SnapshotKey, CURRENT_SYNC_TICK};
use crate::error::{StoreError, StoreResult};
use crate::mvcc::merge_range;
use crate::rows::{DeviceTick, LookupEntry, LookupTick, NewSnapshotRow, Record, SnapshotRow};
use crate::types::{LockKey, LockMode, RecordKey, SequenceNumber, TransactionId};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use ticksync_protocol::{ChangelogRecord, SessionDirection};

/// State of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Transaction is active and can perform operations.
    Active,
    /// Transaction has been committed.
    Committed,
    /// Transaction has been rolled back.
    RolledBack,
}

/// Buffered writes of a transaction, applied together on commit.
#[derive(Debug, Default)]
pub(crate) struct Writes {
    pub(crate) records: BTreeMap<RecordKey, Option<Record>>,
    pub(crate) lookup: BTreeMap<RecordKey, Option<LookupEntry>>,
    pub(crate) snapshots: BTreeMap<SnapshotKey, Option<SnapshotRow>>,
    pub(crate) snapshot_index: BTreeMap<SnapshotIndexKey, Option<u64>>,
    pub(crate) facts: BTreeMap<String, Option<String>>,
    pub(crate) lookup_ticks: BTreeMap<u64, Option<LookupTick>>,
    pub(crate) device_ticks: BTreeMap<u64, Option<DeviceTick>>,
    pub(crate) changelogs: BTreeMap<ChangelogKey, Option<ChangelogRecord>>,
}

fn record_range(record_type: &str, after_id: Option<&str>) -> (Bound<RecordKey>, Bound<RecordKey>) {
    let start = match after_id {
        Some(id) => Bound::Excluded((record_type.to_string(), id.to_string())),
        None => Bound::Included((record_type.to_string(), String::new())),
    };
    (start, Bound::Unbounded)
}

fn partition_range(session_id: &str, after_id: Option<u64>) -> (Bound<SnapshotKey>, Bound<SnapshotKey>) {
    let start = match after_id {
        Some(id) => Bound::Excluded((session_id.to_string(), id)),
        None => Bound::Included((session_id.to_string(), 0)),
    };
    (start, Bound::Included((session_id.to_string(), u64::MAX)))
}

/// A snapshot-isolated unit of work.
///
/// Reads observe the state committed when the transaction began plus the
/// transaction's own writes. Writes become visible to others atomically on
/// commit. Advisory locks taken through the transaction are released when
/// it commits, rolls back, or is dropped.
#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    snapshot: SequenceNumber,
    inner: Arc<DatabaseInner>,
    writes: Writes,
    state: TransactionState,
    audit_paused: bool,
}

impl Transaction {
    pub(crate) fn new(inner: Arc<DatabaseInner>) -> Self {
        let id = inner.next_transaction_id();
        let snapshot = inner.open_snapshot();
        Self {
            id,
            snapshot,
            inner,
            writes: Writes::default(),
            state: TransactionState::Active,
            audit_paused: false,
        }
    }

    /// Returns the transaction ID.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Returns the snapshot sequence number.
    #[must_use]
    pub fn snapshot_seq(&self) -> SequenceNumber {
        self.snapshot
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Checks if the transaction is still active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }

    fn ensure_active(&self) -> StoreResult<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(StoreError::TransactionClosed(self.id))
        }
    }

    /// Suppresses changelog entries for this transaction's writes.
    pub fn pause_audit(&mut self) {
        self.audit_paused = true;
    }

    /// Returns true if changelog generation is suppressed.
    pub fn is_audit_paused(&self) -> bool {
        self.audit_paused
    }

    /// Commits all buffered writes and releases held locks.
    pub fn commit(&mut self) -> StoreResult<SequenceNumber> {
        self.ensure_active()?;
        let writes = std::mem::take(&mut self.writes);
        let seq = self.inner.commit_writes(writes, !self.audit_paused);
        self.finish(TransactionState::Committed);
        Ok(seq)
    }

    /// Discards all buffered writes and releases held locks.
    pub fn rollback(&mut self) {
        if self.is_active() {
            self.writes = Writes::default();
            self.finish(TransactionState::RolledBack);
        }
    }

    fn finish(&mut self, state: TransactionState) {
        self.state = state;
        self.inner.locks.release_all(self.id);
        self.inner.close_snapshot(self.snapshot);
    }

    // Advisory locks

    /// Attempts to take an advisory lock without waiting.
    pub fn try_lock(&self, key: LockKey, mode: LockMode) -> StoreResult<bool> {
        self.ensure_active()?;
        Ok(self.inner.locks.try_acquire(key, self.id, mode))
    }

    /// Takes an advisory lock, waiting until it is available.
    pub async fn lock(&self, key: LockKey, mode: LockMode) -> StoreResult<()> {
        self.ensure_active()?;
        self.inner.locks.acquire(key, self.id, mode).await;
        Ok(())
    }

    // Facts

    /// Reads a fact.
    pub fn fact(&self, key: &str) -> Option<String> {
        if let Some(pending) = self.writes.facts.get(key) {
            return pending.clone();
        }
        self.inner
            .tables
            .read()
            .facts
            .get(&key.to_string(), self.snapshot.as_u64())
            .cloned()
    }

    /// Writes a fact.
    pub fn set_fact(&mut self, key: &str, value: impl Into<String>) -> StoreResult<()> {
        self.ensure_active()?;
        self.writes
            .facts
            .insert(key.to_string(), Some(value.into()));
        Ok(())
    }

    // Live records

    /// Reads a live record.
    pub fn get_record(&self, record_type: &str, id: &str) -> Option<Record> {
        let key = (record_type.to_string(), id.to_string());
        if let Some(pending) = self.writes.records.get(&key) {
            return pending.clone();
        }
        self.inner
            .tables
            .read()
            .records
            .get(&key, self.snapshot.as_u64())
            .cloned()
    }

    /// Scans records of one type in id order, starting after `after_id`.
    ///
    /// Records rejected by `keep` are skipped and do not count towards `limit`.
    pub fn scan_records(
        &self,
        record_type: &str,
        after_id: Option<&str>,
        limit: usize,
        keep: impl FnMut(&Record) -> bool,
    ) -> Vec<Record> {
        let tables = self.inner.tables.read();
        merge_range(
            tables
                .records
                .range(record_range(record_type, after_id), self.snapshot.as_u64())
                .take_while(|(k, _)| k.0 == record_type),
            self.writes
                .records
                .range(record_range(record_type, after_id))
                .take_while(|(k, _)| k.0 == record_type),
            limit,
            keep,
        )
    }

    /// Writes a live record stamped with the current clock value.
    ///
    /// The transaction is registered as a pending edit at that tick until it
    /// finishes, so readers computing a settled tick wait for it.
    pub fn put_record(&mut self, mut record: Record) -> StoreResult<i64> {
        self.ensure_active()?;
        let tick = {
            let counter = self.inner.counter(CURRENT_SYNC_TICK);
            let tick = counter.value()?;
            counter.hold_pending_edit(tick, self.id);
            tick
        };
        record.updated_at_sync_tick = tick;
        self.writes.records.insert(record.key(), Some(record));
        Ok(tick)
    }

    /// Writes a live record stamped with an explicit tick.
    ///
    /// The caller is responsible for having registered the tick.
    pub fn put_record_at(&mut self, mut record: Record, tick: i64) -> StoreResult<()> {
        self.ensure_active()?;
        record.updated_at_sync_tick = tick;
        self.writes.records.insert(record.key(), Some(record));
        Ok(())
    }

    /// Soft-deletes a live record, stamping it like [`put_record`](Self::put_record).
    pub fn delete_record(&mut self, record_type: &str, id: &str) -> StoreResult<()> {
        let mut record = self
            .get_record(record_type, id)
            .ok_or_else(|| StoreError::NotFound(format!("{record_type} {id}")))?;
        record.is_deleted = true;
        self.put_record(record)?;
        Ok(())
    }

    // Lookup table

    /// Reads a lookup entry.
    pub fn get_lookup(&self, record_type: &str, record_id: &str) -> Option<LookupEntry> {
        let key = (record_type.to_string(), record_id.to_string());
        if let Some(pending) = self.writes.lookup.get(&key) {
            return pending.clone();
        }
        self.inner
            .tables
            .read()
            .lookup
            .get(&key, self.snapshot.as_u64())
            .cloned()
    }

    /// Scans the lookup table in key order, starting after `after`.
    pub fn scan_lookup(
        &self,
        after: Option<&RecordKey>,
        limit: usize,
        keep: impl FnMut(&LookupEntry) -> bool,
    ) -> Vec<LookupEntry> {
        let bounds = || {
            let start = match after {
                Some(key) => Bound::Excluded(key.clone()),
                None => Bound::Unbounded,
            };
            (start, Bound::Unbounded)
        };
        let tables = self.inner.tables.read();
        merge_range(
            tables.lookup.range(bounds(), self.snapshot.as_u64()),
            self.writes.lookup.range(bounds()),
            limit,
            keep,
        )
    }

    /// Inserts or replaces a lookup entry.
    pub fn upsert_lookup(&mut self, entry: LookupEntry) -> StoreResult<()> {
        self.ensure_active()?;
        let key = (entry.record_type.clone(), entry.record_id.clone());
        self.writes.lookup.insert(key, Some(entry));
        Ok(())
    }

    /// Number of lookup entries visible to this transaction.
    pub fn count_lookup(&self) -> usize {
        self.scan_lookup(None, usize::MAX, |_| true).len()
    }

    // Snapshot partitions

    /// Inserts a snapshot row unless one with the same direction, type and
    /// record id already exists in the partition.
    ///
    /// Returns the new row id, or `None` if the row was a duplicate.
    pub fn insert_snapshot_row(
        &mut self,
        session_id: &str,
        row: NewSnapshotRow,
    ) -> StoreResult<Option<u64>> {
        self.ensure_active()?;
        if self
            .snapshot_row_id(session_id, row.direction, &row.record_type, &row.record_id)
            .is_some()
        {
            return Ok(None);
        }
        let id = self.inner.next_row_id();
        let index_key = (
            session_id.to_string(),
            row.direction,
            row.record_type.clone(),
            row.record_id.clone(),
        );
        let stored = SnapshotRow {
            id,
            session_id: session_id.to_string(),
            direction: row.direction,
            record_type: row.record_type,
            record_id: row.record_id,
            is_deleted: row.is_deleted,
            saved_at_sync_tick: row.saved_at_sync_tick,
            source_sync_tick: row.source_sync_tick,
            updated_at_by_field_sum: row.updated_at_by_field_sum,
            data: row.data,
        };
        self.writes
            .snapshots
            .insert((session_id.to_string(), id), Some(stored));
        self.writes.snapshot_index.insert(index_key, Some(id));
        Ok(Some(id))
    }

    /// Finds a snapshot row id by its unique key.
    pub fn snapshot_row_id(
        &self,
        session_id: &str,
        direction: SessionDirection,
        record_type: &str,
        record_id: &str,
    ) -> Option<u64> {
        let key = (
            session_id.to_string(),
            direction,
            record_type.to_string(),
            record_id.to_string(),
        );
        if let Some(pending) = self.writes.snapshot_index.get(&key) {
            return *pending;
        }
        self.inner
            .tables
            .read()
            .snapshot_index
            .get(&key, self.snapshot.as_u64())
            .copied()
    }

    /// Reads a snapshot row by id.
    pub fn get_snapshot_row(&self, session_id: &str, id: u64) -> Option<SnapshotRow> {
        let key = (session_id.to_string(), id);
        if let Some(pending) = self.writes.snapshots.get(&key) {
            return pending.clone();
        }
        self.inner
            .tables
            .read()
            .snapshots
            .get(&key, self.snapshot.as_u64())
            .cloned()
    }

    /// Scans a partition in id order, starting after `after_id`.
    pub fn scan_snapshot(
        &self,
        session_id: &str,
        direction: Option<SessionDirection>,
        after_id: Option<u64>,
        limit: usize,
    ) -> Vec<SnapshotRow> {
        let tables = self.inner.tables.read();
        merge_range(
            tables
                .snapshots
                .range(partition_range(session_id, after_id), self.snapshot.as_u64()),
            self.writes
                .snapshots
                .range(partition_range(session_id, after_id)),
            limit,
            |row| direction.map_or(true, |d| row.direction == d),
        )
    }

    /// Counts rows of a partition, optionally of one direction.
    pub fn count_snapshot(&self, session_id: &str, direction: Option<SessionDirection>) -> u64 {
        self.scan_snapshot(session_id, direction, None, usize::MAX)
            .len() as u64
    }

    /// Replaces a snapshot row. The unique key must not change.
    pub fn update_snapshot_row(&mut self, row: SnapshotRow) -> StoreResult<()> {
        self.ensure_active()?;
        self.writes
            .snapshots
            .insert((row.session_id.clone(), row.id), Some(row));
        Ok(())
    }

    /// Deletes a snapshot row.
    pub fn delete_snapshot_row(&mut self, session_id: &str, id: u64) -> StoreResult<bool> {
        self.ensure_active()?;
        let Some(row) = self.get_snapshot_row(session_id, id) else {
            return Ok(false);
        };
        self.writes
            .snapshots
            .insert((session_id.to_string(), id), None);
        self.writes.snapshot_index.insert(
            (
                session_id.to_string(),
                row.direction,
                row.record_type,
                row.record_id,
            ),
            None,
        );
        Ok(true)
    }

    /// Deletes every row of a partition, returning how many were removed.
    pub fn clear_snapshot_partition(&mut self, session_id: &str) -> StoreResult<usize> {
        let rows = self.scan_snapshot(session_id, None, None, usize::MAX);
        for row in &rows {
            self.delete_snapshot_row(session_id, row.id)?;
        }
        Ok(rows.len())
    }

    // Tick bookkeeping

    /// Appends a lookup refresh range.
    pub fn insert_lookup_tick(&mut self, source_start_tick: i64, lookup_end_tick: i64) -> StoreResult<u64> {
        self.ensure_active()?;
        let id = self.inner.next_row_id();
        self.writes.lookup_ticks.insert(
            id,
            Some(LookupTick {
                id,
                source_start_tick,
                lookup_end_tick,
            }),
        );
        Ok(id)
    }

    /// Returns every lookup refresh range, oldest first.
    pub fn lookup_ticks(&self) -> Vec<LookupTick> {
        let tables = self.inner.tables.read();
        merge_range(
            tables
                .lookup_ticks
                .range((Bound::Unbounded, Bound::Unbounded), self.snapshot.as_u64()),
            self.writes.lookup_ticks.iter(),
            usize::MAX,
            |_| true,
        )
    }

    /// Appends a device's persisted tick.
    pub fn insert_device_tick(&mut self, device_id: &str, persisted_at_sync_tick: i64) -> StoreResult<u64> {
        self.ensure_active()?;
        let id = self.inner.next_row_id();
        self.writes.device_ticks.insert(
            id,
            Some(DeviceTick {
                id,
                device_id: device_id.to_string(),
                persisted_at_sync_tick,
            }),
        );
        Ok(id)
    }

    /// Returns every recorded device tick, oldest first.
    pub fn device_ticks(&self) -> Vec<DeviceTick> {
        let tables = self.inner.tables.read();
        merge_range(
            tables
                .device_ticks
                .range((Bound::Unbounded, Bound::Unbounded), self.snapshot.as_u64()),
            self.writes.device_ticks.iter(),
            usize::MAX,
            |_| true,
        )
    }

    // Changelog

    /// Returns changelog entries of a record whose tick lies in `(after_tick, up_to_tick]`.
    pub fn changelogs_for(
        &self,
        record_type: &str,
        record_id: &str,
        after_tick: i64,
        up_to_tick: i64,
    ) -> Vec<ChangelogRecord> {
        let bounds: (Bound<ChangelogKey>, Bound<ChangelogKey>) = (
            Bound::Included((record_type.to_string(), record_id.to_string(), 0)),
            Bound::Included((record_type.to_string(), record_id.to_string(), u64::MAX)),
        );
        self.inner
            .tables
            .read()
            .changelogs
            .range(bounds, self.snapshot.as_u64())
            .map(|(_, entry)| entry)
            .filter(|entry| {
                entry.logged_at_sync_tick > after_tick && entry.logged_at_sync_tick <= up_to_tick
            })
            .cloned()
            .collect()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.rollback();
    }
}

#[cfg(test)]
mod tests {
    use crate::database::Database;
    use crate::rows::{NewSnapshotRow, Record};
    use crate::types::{LockKey, LockMode};
    use serde_json::json;
    use ticksync_protocol::{RecordData, SessionDirection};

    fn data(value: serde_json::Value) -> RecordData {
        value.as_object().cloned().unwrap()
    }

    fn outgoing(record_id: &str, tick: i64) -> NewSnapshotRow {
        NewSnapshotRow {
            direction: SessionDirection::Outgoing,
            record_type: "patients".into(),
            record_id: record_id.into(),
            is_deleted: false,
            saved_at_sync_tick: tick,
            source_sync_tick: tick,
            updated_at_by_field_sum: None,
            data: RecordData::new(),
        }
    }

    #[test]
    fn uncommitted_writes_are_invisible_to_others() {
        let db = Database::new();
        let mut writer = db.begin();
        writer
            .put_record(Record::new("patients", "p1", data(json!({"name": "Ana"}))))
            .unwrap();
        assert!(writer.get_record("patients", "p1").is_some());
        assert!(db.begin().get_record("patients", "p1").is_none());
        writer.commit().unwrap();
        assert!(db.begin().get_record("patients", "p1").is_some());
    }

    #[test]
    fn repeatable_read_ignores_later_commits() {
        let db = Database::new();
        let reader = db.begin();
        db.transaction(|txn| txn.put_record(Record::new("patients", "p1", RecordData::new())))
            .unwrap();
        assert!(reader.get_record("patients", "p1").is_none());
        assert!(reader
            .scan_records("patients", None, 10, |_| true)
            .is_empty());
    }

    #[test]
    fn dropped_transaction_rolls_back_and_releases_locks() {
        let db = Database::new();
        let key = LockKey::global(1);
        {
            let mut txn = db.begin();
            assert!(txn.try_lock(key, LockMode::Exclusive).unwrap());
            txn.put_record(Record::new("patients", "p1", RecordData::new()))
                .unwrap();
        }
        assert!(db.is_lock_free(key));
        assert!(db.begin().get_record("patients", "p1").is_none());
    }

    #[test]
    fn closed_transaction_rejects_writes() {
        let db = Database::new();
        let mut txn = db.begin();
        txn.commit().unwrap();
        assert!(txn.set_fact("k", "v").is_err());
        assert!(txn.commit().is_err());
    }

    #[test]
    fn put_record_stamps_current_tick() {
        let db = Database::new();
        db.increment_fact(crate::CURRENT_SYNC_TICK, 2).unwrap();
        let mut txn = db.begin();
        let tick = txn
            .put_record(Record::new("patients", "p1", RecordData::new()))
            .unwrap();
        assert_eq!(tick, 4);
        assert_eq!(txn.get_record("patients", "p1").unwrap().updated_at_sync_tick, 4);
    }

    #[test]
    fn scan_records_merges_pending_and_stays_in_type() {
        let db = Database::new();
        db.transaction(|txn| {
            for id in ["a", "c", "e"] {
                txn.put_record(Record::new("patients", id, RecordData::new()))?;
            }
            txn.put_record(Record::new("users", "b", RecordData::new()))?;
            Ok(())
        })
        .unwrap();

        let mut txn = db.begin();
        txn.put_record(Record::new("patients", "d", RecordData::new()))
            .unwrap();
        let ids: Vec<String> = txn
            .scan_records("patients", Some("a"), 10, |_| true)
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["c", "d", "e"]);

        let first_two: Vec<String> = txn
            .scan_records("patients", None, 2, |_| true)
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(first_two, vec!["a", "c"]);
    }

    #[test]
    fn snapshot_rows_are_unique_per_direction_and_record() {
        let db = Database::new();
        let mut txn = db.begin();
        let first = txn.insert_snapshot_row("s1", outgoing("p1", 3)).unwrap();
        assert!(first.is_some());
        assert!(txn.insert_snapshot_row("s1", outgoing("p1", 5)).unwrap().is_none());
        assert!(txn.insert_snapshot_row("s2", outgoing("p1", 5)).unwrap().is_some());
        let mut incoming = outgoing("p1", 3);
        incoming.direction = SessionDirection::Incoming;
        assert!(txn.insert_snapshot_row("s1", incoming).unwrap().is_some());
        txn.commit().unwrap();

        let reader = db.begin();
        assert_eq!(reader.count_snapshot("s1", None), 2);
        assert_eq!(reader.count_snapshot("s1", Some(SessionDirection::Outgoing)), 1);
        assert_eq!(reader.count_snapshot("s2", None), 1);
    }

    #[test]
    fn deleting_a_snapshot_row_frees_its_key() {
        let db = Database::new();
        let mut txn = db.begin();
        let id = txn.insert_snapshot_row("s1", outgoing("p1", 3)).unwrap().unwrap();
        assert!(txn.delete_snapshot_row("s1", id).unwrap());
        assert!(txn
            .snapshot_row_id("s1", SessionDirection::Outgoing, "patients", "p1")
            .is_none());
        assert!(txn.insert_snapshot_row("s1", outgoing("p1", 4)).unwrap().is_some());
    }

    #[test]
    fn paused_audit_skips_changelog() {
        let db = Database::new();
        db.transaction(|txn| txn.put_record(Record::new("patients", "p1", RecordData::new())))
            .unwrap();
        db.transaction(|txn| {
            txn.pause_audit();
            txn.put_record(Record::new("patients", "p2", RecordData::new()))
        })
        .unwrap();

        let reader = db.begin();
        assert_eq!(reader.changelogs_for("patients", "p1", -1, i64::MAX).len(), 1);
        assert!(reader.changelogs_for("patients", "p2", -1, i64::MAX).is_empty());
    }

    #[test]
    fn changelog_window_is_half_open() {
        let db = Database::new();
        db.transaction(|txn| txn.put_record(Record::new("patients", "p1", RecordData::new())))
            .unwrap();
        let reader = db.begin();
        // Written at the initial tick of 2.
        assert_eq!(reader.changelogs_for("patients", "p1", 1, 2).len(), 1);
        assert!(reader.changelogs_for("patients", "p1", 2, 10).is_empty());
    }

    mod scan {
        use super::*;
        use proptest::prelude::*;
        use std::collections::BTreeSet;

        proptest! {
            #[test]
            fn chunked_scans_see_committed_and_own_writes_once(
                committed in proptest::collection::btree_set("[a-z]{1,4}", 0..30),
                pending in proptest::collection::btree_set("[a-z]{1,4}", 0..10),
                chunk in 1usize..8,
            ) {
                let db = Database::new();
                db.transaction(|txn| {
                    for id in &committed {
                        txn.put_record(Record::new("notes", id, RecordData::new()))?;
                    }
                    txn.put_record(Record::new("patients", "p1", RecordData::new()))?;
                    Ok(())
                })
                .unwrap();

                let mut txn = db.begin();
                for id in &pending {
                    txn.put_record(Record::new("notes", id, RecordData::new())).unwrap();
                }

                let keep = |r: &Record| !r.id.starts_with('a');
                let mut seen = Vec::new();
                let mut after: Option<String> = None;
                loop {
                    let page = txn.scan_records("notes", after.as_deref(), chunk, keep);
                    prop_assert!(page.len() <= chunk);
                    let Some(last) = page.last() else { break };
                    after = Some(last.id.clone());
                    seen.extend(page.into_iter().map(|r| r.id));
                }

                let expected: Vec<String> = committed
                    .union(&pending)
                    .filter(|id| !id.starts_with('a'))
                    .cloned()
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect();
                prop_assert_eq!(seen, expected);
            }
        }
    }
}
