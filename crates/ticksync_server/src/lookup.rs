//! Incremental maintenance of the sync lookup table.
//!
//! The lookup table holds the latest syncable state of every pullable
//! record, with its patient/facility linkage precomputed. Incremental runs
//! write entries under a pending sentinel tick and resolve it to a fresh
//! tick only after the refresh has committed, so a snapshot reading the
//! table mid-refresh never sees a tick that its own boundary already
//! passed.

use crate::clock::SyncClock;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::locks::{SyncLocks, LOOKUP_REFRESH_LOCK};
use crate::models::ModelRegistry;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use ticksync_protocol::updated_at_by_field_sum;
use ticksync_store::{Database, LookupEntry, RecordKey, Transaction};
use tracing::{debug, error, info};

/// Fact holding the cutoff tick of the last successful refresh.
pub const LOOKUP_UP_TO_TICK: &str = "syncLookupUpToTick";

/// Fact holding record types whose entries must be fully rebuilt.
pub const LOOKUP_REBUILD_TYPES: &str = "syncLookupRebuildTypes";

/// Tick of lookup entries whose real tick is not yet assigned.
pub const LOOKUP_PENDING_TICK: i64 = -1;

/// Debug log type of refresh runs.
pub const LOOKUP_DEBUG_LOG: &str = "syncLookupUpdate";

/// Outcome of one refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupRefresh {
    /// Cutoff of the previous refresh, or -1.
    pub since: i64,
    /// Cutoff of this refresh.
    pub cutoff: i64,
    /// Entries written.
    pub updated: usize,
    /// Tick the pending entries resolved to, for incremental runs.
    pub resolved_tick: Option<i64>,
    /// Whether this was the first build.
    pub initial_build: bool,
}

/// Refreshes the lookup table from the live tables.
#[derive(Clone)]
pub struct LookupUpdater {
    db: Database,
    config: Arc<SyncConfig>,
    clock: SyncClock,
    locks: SyncLocks,
    models: Arc<ModelRegistry>,
}

impl LookupUpdater {
    /// Creates an updater.
    pub fn new(
        db: Database,
        config: Arc<SyncConfig>,
        clock: SyncClock,
        locks: SyncLocks,
        models: Arc<ModelRegistry>,
    ) -> Self {
        Self {
            db,
            config,
            clock,
            locks,
            models,
        }
    }

    /// Returns true once at least one refresh has committed.
    pub fn is_built(&self) -> bool {
        self.db.fact(LOOKUP_UP_TO_TICK).is_some()
    }

    /// Cutoff of the last successful refresh.
    pub fn up_to_tick(&self) -> Option<i64> {
        self.db.fact(LOOKUP_UP_TO_TICK).and_then(|v| v.parse().ok())
    }

    /// Schedules `record_types` for a full rescan on the next refresh.
    pub fn flag_for_rebuild(&self, record_types: &[String]) -> SyncResult<()> {
        let mut txn = self.db.begin();
        let mut flagged = rebuild_types(&txn);
        for record_type in record_types {
            if !flagged.contains(record_type) {
                flagged.push(record_type.clone());
            }
        }
        let encoded =
            serde_json::to_string(&flagged).map_err(|e| SyncError::Internal(e.to_string()))?;
        txn.set_fact(LOOKUP_REBUILD_TYPES, encoded)?;
        txn.commit()?;
        info!(record_types = ?record_types, "lookup types flagged for rebuild");
        Ok(())
    }

    /// Runs one refresh.
    ///
    /// Returns `Ok(None)` if another refresh is already running.
    pub async fn run(&self) -> SyncResult<Option<LookupRefresh>> {
        let Some(_guard) = self.locks.try_global(LOOKUP_REFRESH_LOCK)? else {
            debug!("lookup refresh already running");
            return Ok(None);
        };
        let log_id = self
            .db
            .insert_debug_log(LOOKUP_DEBUG_LOG, json!({ "startedAt": now_millis() }));
        let started = Instant::now();

        let result = self.refresh(log_id).await;
        let duration_ms = started.elapsed().as_millis() as u64;
        self.db.update_debug_log(log_id, |info| {
            info["completedAt"] = json!(now_millis());
            match &result {
                Ok(refresh) => info["updated"] = json!(refresh.updated),
                Err(e) => info["error"] = json!(e.to_string()),
            }
        })?;
        match &result {
            Ok(refresh) => info!(
                since = refresh.since,
                cutoff = refresh.cutoff,
                updated = refresh.updated,
                initial_build = refresh.initial_build,
                duration_ms,
                "lookup table refreshed"
            ),
            Err(e) => error!(error = %e, duration_ms, "lookup table refresh failed"),
        }
        result.map(Some)
    }

    async fn refresh(&self, log_id: u64) -> SyncResult<LookupRefresh> {
        let cutoff = self.clock.tick_tock()?.tick;
        self.clock.wait_for_pending_edits(cutoff).await;

        let since = self.up_to_tick().unwrap_or(-1);
        let initial_build = since == -1;
        self.db
            .update_debug_log(log_id, |info| info["since"] = json!(since))?;

        let mut txn = self.db.begin();
        let rebuild = rebuild_types(&txn);
        let entry_tick = (!initial_build).then_some(LOOKUP_PENDING_TICK);
        let mut updated = 0;
        for model in self.models.pullable(None) {
            let model_since = if rebuild.iter().any(|t| t == model.record_type()) {
                -1
            } else {
                since
            };
            updated += self.refresh_model(&mut txn, model.record_type(), model_since, entry_tick)?;
            tokio::task::yield_now().await;
        }
        if initial_build {
            txn.insert_lookup_tick(since, cutoff)?;
        }
        if !rebuild.is_empty() {
            txn.set_fact(LOOKUP_REBUILD_TYPES, "[]")?;
        }
        // The cutoff commits with the entries; a crash before this point
        // means the next run rescans the same range.
        txn.set_fact(LOOKUP_UP_TO_TICK, cutoff.to_string())?;
        txn.commit()?;

        let resolved_tick = if initial_build {
            None
        } else {
            Some(self.resolve_pending(since)?)
        };

        Ok(LookupRefresh {
            since,
            cutoff,
            updated,
            resolved_tick,
            initial_build,
        })
    }

    fn refresh_model(
        &self,
        txn: &mut Transaction,
        record_type: &str,
        since: i64,
        entry_tick: Option<i64>,
    ) -> SyncResult<usize> {
        let model = self
            .models
            .get(record_type)
            .cloned()
            .ok_or_else(|| SyncError::Internal(format!("model {record_type} vanished")))?;
        let chunk_size = self.config.max_records_per_lookup_chunk;
        let mut after: Option<String> = None;
        let mut written = 0;
        loop {
            let chunk = txn.scan_records(record_type, after.as_deref(), chunk_size, |r| {
                r.updated_at_sync_tick > since
            });
            let Some(last) = chunk.last() else {
                break;
            };
            after = Some(last.id.clone());
            for record in chunk {
                let linkage = model.linkage(&record, txn, &self.models);
                txn.upsert_lookup(LookupEntry {
                    record_type: record.record_type,
                    record_id: record.id,
                    patient_id: linkage.patient_id,
                    facility_id: linkage.facility_id,
                    is_lab_request: linkage.is_lab_request,
                    is_deleted: record.is_deleted,
                    updated_at_sync_tick: entry_tick.unwrap_or(record.updated_at_sync_tick),
                    source_sync_tick: record.updated_at_sync_tick,
                    updated_at_by_field_sum: updated_at_by_field_sum(&record.data),
                    data: record.data,
                })?;
                written += 1;
            }
            debug!(record_type, written, "lookup chunk written");
        }
        Ok(written)
    }

    /// Moves pending entries onto a fresh tick, registering the resolving
    /// transaction as a pending edit at that tick.
    fn resolve_pending(&self, since: i64) -> SyncResult<i64> {
        let mut txn = self.db.begin();
        let tick = self.clock.tick_tock_holding(&txn)?.tock;
        let chunk_size = self.config.max_records_per_lookup_chunk;
        let mut after: Option<RecordKey> = None;
        let mut resolved = 0;
        loop {
            let chunk = txn.scan_lookup(after.as_ref(), chunk_size, |e| {
                e.updated_at_sync_tick == LOOKUP_PENDING_TICK
            });
            let Some(last) = chunk.last() else {
                break;
            };
            after = Some((last.record_type.clone(), last.record_id.clone()));
            for mut entry in chunk {
                entry.updated_at_sync_tick = tick;
                txn.upsert_lookup(entry)?;
                resolved += 1;
            }
        }
        txn.insert_lookup_tick(since, tick)?;
        txn.commit()?;
        debug!(tick, resolved, "pending lookup entries resolved");
        Ok(tick)
    }
}

fn rebuild_types(txn: &Transaction) -> Vec<String> {
    txn.fact(LOOKUP_REBUILD_TYPES)
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default()
}

pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SimpleModel;
    use serde_json::json;
    use ticksync_protocol::{RecordData, SyncDirection};
    use ticksync_store::Record;

    fn data(value: serde_json::Value) -> RecordData {
        value.as_object().cloned().unwrap()
    }

    fn updater(db: &Database) -> LookupUpdater {
        let models = ModelRegistry::new()
            .register(SimpleModel::new("patients", SyncDirection::Bidirectional).patient_root())
            .register(
                SimpleModel::new("encounters", SyncDirection::Bidirectional)
                    .with_patient_field("patient_id"),
            )
            .register(SimpleModel::new("device_logs", SyncDirection::PushToCentral));
        LookupUpdater::new(
            db.clone(),
            Arc::new(SyncConfig::new().with_chunk_size(2)),
            SyncClock::new(db.clone()),
            SyncLocks::new(db.clone()),
            Arc::new(models),
        )
    }

    fn put(db: &Database, record_type: &str, id: &str, value: serde_json::Value) -> i64 {
        db.transaction(|txn| txn.put_record(Record::new(record_type, id, data(value))))
            .unwrap()
    }

    #[tokio::test]
    async fn initial_build_uses_source_ticks() {
        let db = Database::new();
        let updater = updater(&db);
        let t1 = put(&db, "patients", "p1", json!({}));
        put(&db, "encounters", "e1", json!({"patient_id": "p1"}));
        put(&db, "encounters", "e2", json!({"patient_id": "p1"}));
        put(&db, "encounters", "e3", json!({"patient_id": "p2"}));
        put(&db, "device_logs", "l1", json!({}));
        assert!(!updater.is_built());

        let refresh = updater.run().await.unwrap().unwrap();
        assert!(refresh.initial_build);
        assert_eq!(refresh.updated, 4);
        assert_eq!(refresh.resolved_tick, None);
        assert!(updater.is_built());
        assert_eq!(updater.up_to_tick(), Some(refresh.cutoff));

        let txn = db.begin();
        let p1 = txn.get_lookup("patients", "p1").unwrap();
        assert_eq!(p1.updated_at_sync_tick, t1);
        assert_eq!(p1.patient_id.as_deref(), Some("p1"));
        assert!(txn.get_lookup("device_logs", "l1").is_none());
        assert_eq!(txn.lookup_ticks().len(), 1);

        let logs = db.debug_logs(LOOKUP_DEBUG_LOG);
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].info["updated"], json!(4));
        assert!(logs[0].info.get("completedAt").is_some());
    }

    #[tokio::test]
    async fn incremental_run_resolves_to_fresh_tick() {
        let db = Database::new();
        let updater = updater(&db);
        put(&db, "patients", "p1", json!({}));
        let first = updater.run().await.unwrap().unwrap();

        let edited = put(&db, "patients", "p1", json!({"name": "x"}));
        put(&db, "patients", "p2", json!({}));
        let second = updater.run().await.unwrap().unwrap();
        assert!(!second.initial_build);
        assert_eq!(second.since, first.cutoff);
        assert_eq!(second.updated, 2);
        let resolved = second.resolved_tick.unwrap();
        assert!(resolved > second.cutoff);

        let txn = db.begin();
        let p1 = txn.get_lookup("patients", "p1").unwrap();
        assert_eq!(p1.updated_at_sync_tick, resolved);
        assert_eq!(p1.source_sync_tick, edited);
        assert_eq!(p1.data.get("name"), Some(&json!("x")));
        assert!(txn
            .scan_lookup(None, usize::MAX, |e| e.updated_at_sync_tick == LOOKUP_PENDING_TICK)
            .is_empty());
        assert_eq!(txn.lookup_ticks().len(), 2);
    }

    #[tokio::test]
    async fn unchanged_records_are_not_rewritten() {
        let db = Database::new();
        let updater = updater(&db);
        put(&db, "patients", "p1", json!({}));
        updater.run().await.unwrap().unwrap();
        let again = updater.run().await.unwrap().unwrap();
        assert_eq!(again.updated, 0);
    }

    #[tokio::test]
    async fn flagged_types_are_rebuilt() {
        let db = Database::new();
        let updater = updater(&db);
        put(&db, "patients", "p1", json!({}));
        put(&db, "encounters", "e1", json!({"patient_id": "p1"}));
        updater.run().await.unwrap().unwrap();

        updater.flag_for_rebuild(&["encounters".to_string()]).unwrap();
        let refresh = updater.run().await.unwrap().unwrap();
        assert_eq!(refresh.updated, 1);
        assert_eq!(db.fact(LOOKUP_REBUILD_TYPES).as_deref(), Some("[]"));
    }

    #[tokio::test]
    async fn concurrent_refresh_is_skipped() {
        let db = Database::new();
        let updater = updater(&db);
        let locks = SyncLocks::new(db.clone());
        let _held = locks.try_global(LOOKUP_REFRESH_LOCK).unwrap().unwrap();
        assert!(updater.run().await.unwrap().is_none());
    }
}
