//! Durable checkpoints of the latest committed state.
//!
//! A checkpoint captures the newest committed version of every row plus
//! the autocommit system tables. Advisory locks and version history are
//! not persisted: after a restore no transaction is in flight, which is
//! exactly the state a crashed process leaves behind.

use crate::database::{Database, DatabaseInner, StoreOptions};
use crate::error::StoreResult;
use crate::rows::{
    DebugLog, DeviceTick, LookupEntry, LookupTick, QueuedDevice, Record, SnapshotRow, SyncSession,
};
use crate::transaction::Writes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use ticksync_protocol::ChangelogRecord;
use tracing::info;

const CHECKPOINT_VERSION: u32 = 1;

#[derive(Debug, Default, Serialize, Deserialize)]
struct CheckpointImage {
    version: u32,
    next_row_id: u64,
    facts: Vec<(String, String)>,
    records: Vec<Record>,
    lookup: Vec<LookupEntry>,
    snapshots: Vec<SnapshotRow>,
    lookup_ticks: Vec<LookupTick>,
    device_ticks: Vec<DeviceTick>,
    changelogs: Vec<ChangelogRecord>,
    sessions: Vec<SyncSession>,
    queue: Vec<QueuedDevice>,
    debug_logs: Vec<DebugLog>,
}

/// Counts of what a checkpoint holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CheckpointStats {
    /// Live records.
    pub records: usize,
    /// Lookup entries.
    pub lookup: usize,
    /// Snapshot rows across all partitions.
    pub snapshots: usize,
    /// Session rows.
    pub sessions: usize,
}

impl CheckpointImage {
    fn stats(&self) -> CheckpointStats {
        CheckpointStats {
            records: self.records.len(),
            lookup: self.lookup.len(),
            snapshots: self.snapshots.len(),
            sessions: self.sessions.len(),
        }
    }
}

impl Database {
    /// Writes the latest committed state to `path`.
    ///
    /// The file is written to a sibling temporary path and renamed into
    /// place, so a crash never leaves a half-written checkpoint.
    pub fn checkpoint(&self, path: &Path) -> StoreResult<CheckpointStats> {
        let image = self.image();
        let stats = image.stats();

        let tmp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            serde_json::to_writer(&mut file, &image)?;
            file.flush()?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        info!(path = %path.display(), records = stats.records, sessions = stats.sessions, "checkpoint written");
        Ok(stats)
    }

    /// Counts what a checkpoint taken now would hold.
    pub fn stats(&self) -> CheckpointStats {
        self.image().stats()
    }

    /// Live record counts by type, deleted records included.
    pub fn record_counts(&self) -> BTreeMap<String, usize> {
        let tables = self.inner.tables.read();
        let mut counts = BTreeMap::new();
        for (key, _) in tables.records.latest_rows() {
            *counts.entry(key.0.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Opens a database from a checkpoint written by [`checkpoint`](Self::checkpoint).
    pub fn restore(path: &Path, options: StoreOptions) -> StoreResult<Self> {
        let bytes = fs::read(path)?;
        let image: CheckpointImage = serde_json::from_slice(&bytes)?;
        let db = Database {
            inner: Arc::new(DatabaseInner::new(options)),
        };

        let mut writes = Writes::default();
        for (key, value) in image.facts {
            writes.facts.insert(key, Some(value));
        }
        for record in image.records {
            writes.records.insert(record.key(), Some(record));
        }
        for entry in image.lookup {
            writes.lookup.insert(
                (entry.record_type.clone(), entry.record_id.clone()),
                Some(entry),
            );
        }
        for row in image.snapshots {
            writes.snapshot_index.insert(
                (
                    row.session_id.clone(),
                    row.direction,
                    row.record_type.clone(),
                    row.record_id.clone(),
                ),
                Some(row.id),
            );
            writes
                .snapshots
                .insert((row.session_id.clone(), row.id), Some(row));
        }
        for tick in image.lookup_ticks {
            writes.lookup_ticks.insert(tick.id, Some(tick));
        }
        for tick in image.device_ticks {
            writes.device_ticks.insert(tick.id, Some(tick));
        }
        for entry in image.changelogs {
            writes.changelogs.insert(
                (entry.record_type.clone(), entry.record_id.clone(), entry.id),
                Some(entry),
            );
        }
        db.inner.commit_writes(writes, false);

        {
            let mut system = db.inner.system.write();
            system.sessions = image
                .sessions
                .into_iter()
                .map(|s| (s.id.clone(), s))
                .collect();
            system.queue = image
                .queue
                .into_iter()
                .map(|q| (q.device_id.clone(), q))
                .collect();
            system.debug_logs = image.debug_logs;
        }
        db.inner
            .next_row_id
            .store(image.next_row_id.max(1), Ordering::SeqCst);
        info!(path = %path.display(), version = image.version, "checkpoint restored");
        Ok(db)
    }

    fn image(&self) -> CheckpointImage {
        let tables = self.inner.tables.read();
        let system = self.inner.system.read();
        CheckpointImage {
            version: CHECKPOINT_VERSION,
            next_row_id: self.inner.next_row_id.load(Ordering::SeqCst),
            facts: tables
                .facts
                .latest_rows()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            records: tables.records.latest_rows().map(|(_, v)| v.clone()).collect(),
            lookup: tables.lookup.latest_rows().map(|(_, v)| v.clone()).collect(),
            snapshots: tables
                .snapshots
                .latest_rows()
                .map(|(_, v)| v.clone())
                .collect(),
            lookup_ticks: tables
                .lookup_ticks
                .latest_rows()
                .map(|(_, v)| *v)
                .collect(),
            device_ticks: tables
                .device_ticks
                .latest_rows()
                .map(|(_, v)| v.clone())
                .collect(),
            changelogs: tables
                .changelogs
                .latest_rows()
                .map(|(_, v)| v.clone())
                .collect(),
            sessions: system.sessions.values().cloned().collect(),
            queue: system.queue.values().cloned().collect(),
            debug_logs: system.debug_logs.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rows::{NewSnapshotRow, SessionParameters};
    use crate::types::{LockKey, LockMode};
    use crate::CURRENT_SYNC_TICK;
    use ticksync_protocol::{RecordData, SessionDirection};

    #[test]
    fn checkpoint_round_trips_committed_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("central.json");

        let db = Database::new();
        db.increment_fact(CURRENT_SYNC_TICK, 2).unwrap();
        db.transaction(|txn| {
            txn.put_record(Record::new("patients", "p1", RecordData::new()))?;
            txn.insert_snapshot_row(
                "s1",
                NewSnapshotRow {
                    direction: SessionDirection::Outgoing,
                    record_type: "patients".into(),
                    record_id: "p1".into(),
                    is_deleted: false,
                    saved_at_sync_tick: 4,
                    source_sync_tick: 4,
                    updated_at_by_field_sum: None,
                    data: RecordData::new(),
                },
            )?;
            txn.insert_device_tick("dev-1", 4)?;
            Ok(())
        })
        .unwrap();
        db.insert_session(SyncSession::new("s1", SessionParameters::default()));

        // Uncommitted work and held locks do not survive.
        let mut pending = db.begin();
        pending
            .put_record(Record::new("patients", "p2", RecordData::new()))
            .unwrap();
        assert!(pending.try_lock(LockKey::session(1), LockMode::Exclusive).unwrap());

        let stats = db.checkpoint(&path).unwrap();
        assert_eq!(stats.records, 1);
        assert_eq!(stats.snapshots, 1);

        let restored = Database::restore(&path, StoreOptions::default()).unwrap();
        assert_eq!(restored.fact(CURRENT_SYNC_TICK).as_deref(), Some("4"));
        assert!(restored.session("s1").is_some());
        assert!(restored.is_lock_free(LockKey::session(1)));

        let txn = restored.begin();
        assert!(txn.get_record("patients", "p1").is_some());
        assert!(txn.get_record("patients", "p2").is_none());
        assert_eq!(txn.count_snapshot("s1", None), 1);
        assert_eq!(txn.device_ticks().len(), 1);
        assert_eq!(txn.changelogs_for("patients", "p1", -1, i64::MAX).len(), 1);
        assert!(txn
            .snapshot_row_id("s1", SessionDirection::Outgoing, "patients", "p1")
            .is_some());
    }

    #[test]
    fn stats_count_latest_rows_by_type() {
        let db = Database::new();
        db.transaction(|txn| {
            txn.put_record(Record::new("patients", "p1", RecordData::new()))?;
            txn.put_record(Record::new("patients", "p2", RecordData::new()))?;
            txn.put_record(Record::new("notes", "n1", RecordData::new()))?;
            Ok(())
        })
        .unwrap();
        db.transaction(|txn| txn.delete_record("notes", "n1")).unwrap();

        assert_eq!(db.stats().records, 3);
        let counts = db.record_counts();
        assert_eq!(counts.get("patients"), Some(&2));
        assert_eq!(counts.get("notes"), Some(&1));
    }
}
