//! The database handle and its shared state.

use crate::error::{StoreError, StoreResult};
use crate::locks::AdvisoryLocks;
use crate::mvcc::VersionedTable;
use crate::rows::{
    DebugLog, DeviceTick, LookupEntry, LookupTick, QueuedDevice, Record, SnapshotRow, SyncSession,
};
use crate::transaction::{Transaction, Writes};
use crate::types::{LockKey, LockMode, LockSpace, RecordKey, SequenceNumber, TransactionId};
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde_json::Value;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use ticksync_protocol::{ChangelogRecord, SessionDirection};
use tracing::debug;

/// Fact key of the global sync clock.
pub const CURRENT_SYNC_TICK: &str = "currentSyncTick";

/// Value the clock starts at in a fresh database.
pub const INITIAL_SYNC_TICK: i64 = 2;

pub(crate) type SnapshotKey = (String, u64);
pub(crate) type SnapshotIndexKey = (String, SessionDirection, String, String);
pub(crate) type ChangelogKey = (String, String, u64);

/// Multi-version tables read and written through transactions.
#[derive(Debug, Default)]
pub(crate) struct Tables {
    pub(crate) records: VersionedTable<RecordKey, Record>,
    pub(crate) lookup: VersionedTable<RecordKey, LookupEntry>,
    pub(crate) snapshots: VersionedTable<SnapshotKey, SnapshotRow>,
    pub(crate) snapshot_index: VersionedTable<SnapshotIndexKey, u64>,
    pub(crate) facts: VersionedTable<String, String>,
    pub(crate) lookup_ticks: VersionedTable<u64, LookupTick>,
    pub(crate) device_ticks: VersionedTable<u64, DeviceTick>,
    pub(crate) changelogs: VersionedTable<ChangelogKey, ChangelogRecord>,
}

/// Autocommit tables, visible to every reader as soon as they are written.
#[derive(Debug, Default)]
pub(crate) struct SystemTables {
    pub(crate) sessions: BTreeMap<String, SyncSession>,
    pub(crate) queue: BTreeMap<String, QueuedDevice>,
    pub(crate) debug_logs: Vec<DebugLog>,
}

/// Options fixed when a database is opened.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Record a changelog entry for every committed write to a live table.
    pub audit_enabled: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            audit_enabled: true,
        }
    }
}

#[derive(Debug)]
pub(crate) struct DatabaseInner {
    pub(crate) options: StoreOptions,
    pub(crate) tables: RwLock<Tables>,
    pub(crate) system: RwLock<SystemTables>,
    pub(crate) locks: AdvisoryLocks,
    next_txid: AtomicU64,
    next_seq: AtomicU64,
    committed_seq: AtomicU64,
    pub(crate) next_row_id: AtomicU64,
    commit_lock: Mutex<()>,
    counter_lock: Mutex<()>,
    active_snapshots: Mutex<BTreeMap<u64, usize>>,
}

impl DatabaseInner {
    pub(crate) fn new(options: StoreOptions) -> Self {
        Self {
            options,
            tables: RwLock::new(Tables::default()),
            system: RwLock::new(SystemTables::default()),
            locks: AdvisoryLocks::new(),
            next_txid: AtomicU64::new(1),
            next_seq: AtomicU64::new(1),
            committed_seq: AtomicU64::new(0),
            next_row_id: AtomicU64::new(1),
            commit_lock: Mutex::new(()),
            counter_lock: Mutex::new(()),
            active_snapshots: Mutex::new(BTreeMap::new()),
        }
    }

    pub(crate) fn next_transaction_id(&self) -> TransactionId {
        TransactionId::new(self.next_txid.fetch_add(1, Ordering::SeqCst))
    }

    pub(crate) fn next_row_id(&self) -> u64 {
        self.next_row_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Takes a snapshot and registers it so vacuum keeps its versions.
    pub(crate) fn open_snapshot(&self) -> SequenceNumber {
        let mut active = self.active_snapshots.lock();
        let seq = self.committed_seq.load(Ordering::SeqCst);
        *active.entry(seq).or_insert(0) += 1;
        SequenceNumber::new(seq)
    }

    pub(crate) fn close_snapshot(&self, snapshot: SequenceNumber) {
        let mut active = self.active_snapshots.lock();
        if let Some(count) = active.get_mut(&snapshot.as_u64()) {
            *count -= 1;
            if *count == 0 {
                active.remove(&snapshot.as_u64());
            }
        }
    }

    fn vacuum_horizon(&self) -> u64 {
        let active = self.active_snapshots.lock();
        active
            .keys()
            .next()
            .copied()
            .unwrap_or_else(|| self.committed_seq.load(Ordering::SeqCst))
    }

    /// Applies a transaction's writes atomically under the commit lock.
    pub(crate) fn commit_writes(&self, writes: Writes, audit: bool) -> SequenceNumber {
        let _commit = self.commit_lock.lock();
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let mut tables = self.tables.write();

        let record_audit = audit && self.options.audit_enabled;
        for (key, value) in writes.records {
            if record_audit {
                if let Some(record) = &value {
                    let id = self.next_row_id();
                    let entry = ChangelogRecord {
                        id,
                        record_type: record.record_type.clone(),
                        record_id: record.id.clone(),
                        logged_at_sync_tick: record.updated_at_sync_tick,
                        record_data: record.data.clone(),
                    };
                    tables.changelogs.apply(
                        (record.record_type.clone(), record.id.clone(), id),
                        Some(entry),
                        seq,
                    );
                }
            }
            tables.records.apply(key, value, seq);
        }
        for (key, value) in writes.lookup {
            tables.lookup.apply(key, value, seq);
        }
        for (key, value) in writes.snapshots {
            tables.snapshots.apply(key, value, seq);
        }
        for (key, value) in writes.snapshot_index {
            tables.snapshot_index.apply(key, value, seq);
        }
        for (key, value) in writes.facts {
            tables.facts.apply(key, value, seq);
        }
        for (key, value) in writes.lookup_ticks {
            tables.lookup_ticks.apply(key, value, seq);
        }
        for (key, value) in writes.device_ticks {
            tables.device_ticks.apply(key, value, seq);
        }
        for (key, value) in writes.changelogs {
            tables.changelogs.apply(key, value, seq);
        }

        self.committed_seq.store(seq, Ordering::SeqCst);
        SequenceNumber::new(seq)
    }

    pub(crate) fn latest_fact(&self, key: &str) -> Option<String> {
        self.tables.read().facts.latest(&key.to_string()).cloned()
    }

    pub(crate) fn counter(&self, key: &str) -> CounterGuard<'_> {
        CounterGuard {
            inner: self,
            key: key.to_string(),
            _guard: self.counter_lock.lock(),
        }
    }
}

/// Exclusive access to an integer fact used as a counter.
///
/// While the guard is held no other caller can read-then-write or
/// increment any counter, so reading a value and registering a hold on it
/// is atomic with respect to increments.
pub struct CounterGuard<'a> {
    inner: &'a DatabaseInner,
    key: String,
    _guard: MutexGuard<'a, ()>,
}

impl CounterGuard<'_> {
    /// Returns the current value of the counter.
    pub fn value(&self) -> StoreResult<i64> {
        match self.inner.latest_fact(&self.key) {
            None => Ok(0),
            Some(value) => value.parse().map_err(|_| StoreError::InvalidFact {
                key: self.key.clone(),
                value,
            }),
        }
    }

    /// Adds `by` to the counter, committing immediately, and returns the new value.
    pub fn increment(&mut self, by: i64) -> StoreResult<i64> {
        let next = self.value()? + by;
        let mut writes = Writes::default();
        writes.facts.insert(self.key.clone(), Some(next.to_string()));
        self.inner.commit_writes(writes, false);
        Ok(next)
    }

    /// Registers `owner` as a writer still in flight at `tick`.
    pub fn hold_pending_edit(&self, tick: i64, owner: TransactionId) {
        self.inner
            .locks
            .register_shared(LockKey::pending_edit(tick), owner);
    }
}

/// Handle to an embedded store. Cloning is cheap and shares the state.
///
/// # Example
///
/// ```rust
/// use ticksync_store::{Database, Record};
///
/// let db = Database::new();
/// db.transaction(|txn| {
///     txn.put_record(Record::new("patients", "p1", Default::default()))
/// })
/// .unwrap();
/// let txn = db.begin();
/// assert!(txn.get_record("patients", "p1").is_some());
/// ```
#[derive(Debug, Clone)]
pub struct Database {
    pub(crate) inner: Arc<DatabaseInner>,
}

impl Default for Database {
    fn default() -> Self {
        Self::new()
    }
}

impl Database {
    /// Creates an empty in-memory database with default options.
    pub fn new() -> Self {
        Self::with_options(StoreOptions::default())
    }

    /// Creates an empty in-memory database.
    pub fn with_options(options: StoreOptions) -> Self {
        let db = Self {
            inner: Arc::new(DatabaseInner::new(options)),
        };
        let mut writes = Writes::default();
        writes.facts.insert(
            CURRENT_SYNC_TICK.to_string(),
            Some(INITIAL_SYNC_TICK.to_string()),
        );
        db.inner.commit_writes(writes, false);
        db
    }

    /// Returns the options the database was opened with.
    pub fn options(&self) -> &StoreOptions {
        &self.inner.options
    }

    /// Begins a snapshot-isolated transaction.
    pub fn begin(&self) -> Transaction {
        Transaction::new(self.inner.clone())
    }

    /// Runs `f` in a transaction, committing if it returns `Ok`.
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&mut Transaction) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut txn = self.begin();
        let value = f(&mut txn)?;
        txn.commit()?;
        Ok(value)
    }

    /// Returns the sequence number of the latest commit.
    pub fn committed_seq(&self) -> SequenceNumber {
        SequenceNumber::new(self.inner.committed_seq.load(Ordering::SeqCst))
    }

    /// Locks the counter stored under `key`.
    pub fn counter(&self, key: &str) -> CounterGuard<'_> {
        self.inner.counter(key)
    }

    /// Atomically adds `by` to the counter under `key` and returns the new value.
    pub fn increment_fact(&self, key: &str, by: i64) -> StoreResult<i64> {
        self.counter(key).increment(by)
    }

    /// Returns the latest committed value of a fact.
    pub fn fact(&self, key: &str) -> Option<String> {
        self.inner.latest_fact(key)
    }

    /// Sets a fact outside of any transaction.
    pub fn set_fact(&self, key: &str, value: impl Into<String>) -> StoreResult<()> {
        let value = value.into();
        self.transaction(|txn| txn.set_fact(key, value))
    }

    /// Returns the advisory lock table.
    pub fn locks(&self) -> &AdvisoryLocks {
        &self.inner.locks
    }

    /// Allocates an owner id for locks held outside a transaction.
    pub fn lock_owner(&self) -> TransactionId {
        self.inner.next_transaction_id()
    }

    /// Returns true if `key` could be acquired right now.
    pub fn is_lock_free(&self, key: LockKey) -> bool {
        self.inner.locks.is_free(key)
    }

    /// Waits until every writer registered at a tick below `tick` has finished.
    pub async fn wait_for_pending_edits(&self, tick: i64) {
        let pending: Vec<LockKey> = self
            .inner
            .locks
            .held_keys(LockSpace::PendingEdit)
            .into_iter()
            .filter(|key| key.id < tick)
            .collect();
        if pending.is_empty() {
            return;
        }
        debug!(below = tick, pending = pending.len(), "waiting for pending edits");
        let waiter = self.inner.next_transaction_id();
        for key in pending {
            self.inner
                .locks
                .acquire(key, waiter, LockMode::Exclusive)
                .await;
            self.inner.locks.release_all(waiter);
        }
    }

    /// Drops version history that no open transaction can observe.
    ///
    /// Returns the number of versions removed.
    pub fn vacuum(&self) -> usize {
        let horizon = self.inner.vacuum_horizon();
        let mut tables = self.inner.tables.write();
        tables.records.prune_all(horizon)
            + tables.lookup.prune_all(horizon)
            + tables.snapshots.prune_all(horizon)
            + tables.snapshot_index.prune_all(horizon)
            + tables.facts.prune_all(horizon)
            + tables.lookup_ticks.prune_all(horizon)
            + tables.device_ticks.prune_all(horizon)
            + tables.changelogs.prune_all(horizon)
    }

    /// Drops version history of one session's snapshot partition.
    pub fn vacuum_snapshot_partition(&self, session_id: &str) -> usize {
        let horizon = self.inner.vacuum_horizon();
        let mut tables = self.inner.tables.write();
        let rows = (
            Bound::Included((session_id.to_string(), 0)),
            Bound::Included((session_id.to_string(), u64::MAX)),
        );
        let index = (
            Bound::Included((
                session_id.to_string(),
                SessionDirection::Incoming,
                String::new(),
                String::new(),
            )),
            Bound::Excluded((
                format!("{session_id}\u{0}"),
                SessionDirection::Incoming,
                String::new(),
                String::new(),
            )),
        );
        tables.snapshots.prune(rows, horizon) + tables.snapshot_index.prune(index, horizon)
    }

    /// Deletes every row of a session's snapshot partition.
    pub fn drop_snapshot_partition(&self, session_id: &str) -> StoreResult<usize> {
        let removed = self.transaction(|txn| txn.clear_snapshot_partition(session_id))?;
        self.vacuum_snapshot_partition(session_id);
        Ok(removed)
    }

    /// Number of physical versions held across all tables.
    pub fn version_count(&self) -> usize {
        let tables = self.inner.tables.read();
        tables.records.version_count()
            + tables.lookup.version_count()
            + tables.snapshots.version_count()
            + tables.snapshot_index.version_count()
            + tables.facts.version_count()
            + tables.lookup_ticks.version_count()
            + tables.device_ticks.version_count()
            + tables.changelogs.version_count()
    }

    // Sessions

    /// Inserts a session row.
    pub fn insert_session(&self, session: SyncSession) {
        self.inner
            .system
            .write()
            .sessions
            .insert(session.id.clone(), session);
    }

    /// Returns a session row.
    pub fn session(&self, id: &str) -> Option<SyncSession> {
        self.inner.system.read().sessions.get(id).cloned()
    }

    /// Updates a session row in place and returns the new value.
    pub fn update_session(
        &self,
        id: &str,
        f: impl FnOnce(&mut SyncSession),
    ) -> StoreResult<SyncSession> {
        let mut system = self.inner.system.write();
        let session = system
            .sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("session {id}")))?;
        f(session);
        Ok(session.clone())
    }

    /// Returns every session matching `predicate`.
    pub fn find_sessions(&self, predicate: impl Fn(&SyncSession) -> bool) -> Vec<SyncSession> {
        self.inner
            .system
            .read()
            .sessions
            .values()
            .filter(|s| predicate(s))
            .cloned()
            .collect()
    }

    /// Counts sessions matching `predicate`.
    pub fn count_sessions(&self, predicate: impl Fn(&SyncSession) -> bool) -> usize {
        self.inner
            .system
            .read()
            .sessions
            .values()
            .filter(|s| predicate(s))
            .count()
    }

    /// Deletes a session row.
    pub fn delete_session(&self, id: &str) -> Option<SyncSession> {
        self.inner.system.write().sessions.remove(id)
    }

    // Device queue

    /// Inserts or updates a queue entry through `f`, which receives the
    /// existing entry if there is one.
    pub fn upsert_queued_device(
        &self,
        device_id: &str,
        f: impl FnOnce(Option<&QueuedDevice>) -> QueuedDevice,
    ) -> QueuedDevice {
        let mut system = self.inner.system.write();
        let updated = f(system.queue.get(device_id));
        system
            .queue
            .insert(device_id.to_string(), updated.clone());
        updated
    }

    /// Returns every queue entry.
    pub fn queued_devices(&self) -> Vec<QueuedDevice> {
        self.inner.system.read().queue.values().cloned().collect()
    }

    /// Removes a queue entry, returning true if it existed.
    pub fn remove_queued_device(&self, device_id: &str) -> bool {
        self.inner.system.write().queue.remove(device_id).is_some()
    }

    // Debug logs

    /// Appends a diagnostic log row and returns its id.
    pub fn insert_debug_log(&self, log_type: &str, info: Value) -> u64 {
        let id = self.inner.next_row_id();
        self.inner.system.write().debug_logs.push(DebugLog {
            id,
            log_type: log_type.to_string(),
            info,
            created_at: SystemTime::now(),
        });
        id
    }

    /// Updates the details of a diagnostic log row.
    pub fn update_debug_log(&self, id: u64, f: impl FnOnce(&mut Value)) -> StoreResult<()> {
        let mut system = self.inner.system.write();
        let log = system
            .debug_logs
            .iter_mut()
            .find(|log| log.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("debug log {id}")))?;
        f(&mut log.info);
        Ok(())
    }

    /// Returns diagnostic logs of one type, oldest first.
    pub fn debug_logs(&self, log_type: &str) -> Vec<DebugLog> {
        self.inner
            .system
            .read()
            .debug_logs
            .iter()
            .filter(|log| log.log_type == log_type)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rows::SessionParameters;
    use std::time::Duration;

    #[test]
    fn clock_starts_at_initial_tick() {
        let db = Database::new();
        assert_eq!(db.counter(CURRENT_SYNC_TICK).value().unwrap(), INITIAL_SYNC_TICK);
        assert_eq!(db.increment_fact(CURRENT_SYNC_TICK, 2).unwrap(), 4);
        assert_eq!(db.fact(CURRENT_SYNC_TICK).as_deref(), Some("4"));
    }

    #[test]
    fn non_integer_fact_is_an_error() {
        let db = Database::new();
        db.set_fact("weird", "abc").unwrap();
        assert!(matches!(
            db.increment_fact("weird", 1),
            Err(StoreError::InvalidFact { .. })
        ));
    }

    #[test]
    fn session_rows_are_autocommit() {
        let db = Database::new();
        db.insert_session(SyncSession::new("s1", SessionParameters::default()));
        let updated = db
            .update_session("s1", |s| s.started_at_tick = Some(9))
            .unwrap();
        assert_eq!(updated.started_at_tick, Some(9));
        assert_eq!(db.count_sessions(|s| s.started_at_tick.is_some()), 1);
        assert!(matches!(
            db.update_session("missing", |_| {}),
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn pending_edit_barrier_waits_for_older_writers() {
        let db = Database::new();
        let mut writer = db.begin();
        writer
            .put_record(Record::new("patients", "p1", Default::default()))
            .unwrap();
        let tick = db.counter(CURRENT_SYNC_TICK).value().unwrap();

        // A barrier at the writer's own tick does not wait for it.
        tokio::time::timeout(Duration::from_millis(50), db.wait_for_pending_edits(tick))
            .await
            .unwrap();

        let barrier = {
            let db = db.clone();
            tokio::spawn(async move { db.wait_for_pending_edits(tick + 1).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!barrier.is_finished());

        writer.commit().unwrap();
        tokio::time::timeout(Duration::from_secs(1), barrier)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn vacuum_keeps_versions_for_open_snapshots() {
        let db = Database::new();
        db.transaction(|txn| txn.put_record(Record::new("facilities", "f1", Default::default())))
            .unwrap();
        let reader = db.begin();
        db.transaction(|txn| {
            let mut record = Record::new("facilities", "f1", Default::default());
            record.is_deleted = true;
            txn.put_record(record)
        })
        .unwrap();

        db.vacuum();
        let seen = reader.get_record("facilities", "f1").unwrap();
        assert!(!seen.is_deleted);
        drop(reader);

        let before = db.version_count();
        db.vacuum();
        assert!(db.version_count() < before);
    }

    #[test]
    fn vacuum_prunes_every_table_and_keeps_latest_state() {
        use crate::rows::{LookupEntry, NewSnapshotRow};

        let db = Database::new();
        let lookup = |tick: i64| LookupEntry {
            record_type: "patients".into(),
            record_id: "p1".into(),
            patient_id: Some("p1".into()),
            facility_id: None,
            is_lab_request: false,
            is_deleted: false,
            updated_at_sync_tick: tick,
            source_sync_tick: tick,
            updated_at_by_field_sum: None,
            data: Default::default(),
        };
        for round in 0..3i64 {
            db.transaction(|txn| {
                txn.put_record(Record::new("patients", "p1", Default::default()))?;
                txn.upsert_lookup(lookup(round))?;
                txn.set_fact("lookupUpToTick", round.to_string())?;
                txn.insert_lookup_tick(round, round + 1)?;
                txn.insert_device_tick("dev", round)?;
                txn.insert_snapshot_row(
                    "s1",
                    NewSnapshotRow {
                        direction: SessionDirection::Outgoing,
                        record_type: "patients".into(),
                        record_id: format!("p{round}"),
                        is_deleted: false,
                        saved_at_sync_tick: round,
                        source_sync_tick: round,
                        updated_at_by_field_sum: None,
                        data: Default::default(),
                    },
                )?;
                Ok(())
            })
            .unwrap();
        }

        let before = db.version_count();
        assert!(db.vacuum() > 0);
        assert!(db.version_count() < before);

        let txn = db.begin();
        assert!(txn.get_record("patients", "p1").is_some());
        assert_eq!(txn.get_lookup("patients", "p1").unwrap().updated_at_sync_tick, 2);
        assert_eq!(txn.fact("lookupUpToTick").as_deref(), Some("2"));
        assert_eq!(txn.lookup_ticks().len(), 3);
        assert_eq!(txn.device_ticks().len(), 3);
        assert_eq!(txn.count_snapshot("s1", None), 3);
        assert_eq!(txn.changelogs_for("patients", "p1", -1, i64::MAX).len(), 3);
    }
}
