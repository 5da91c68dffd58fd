//! Capture of outgoing changes into a session's snapshot partition.
//!
//! A snapshot runs inside one repeatable-read transaction. Rows are either
//! scanned per model from the live tables or read in one pass from the
//! lookup table; both produce the same outgoing rows for the same state.

use crate::clock::SyncClock;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::lookup::{LOOKUP_PENDING_TICK, LOOKUP_UP_TO_TICK};
use crate::models::{Linkage, ModelRegistry, SyncModel};
use crate::session::SessionRegistry;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use ticksync_protocol::{updated_at_by_field_sum, SessionDirection, SyncRecord};
use ticksync_store::{Database, LookupEntry, NewSnapshotRow, RecordKey, Transaction};
use tracing::{debug, info};

/// What a pull asked for, resolved against the session and configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotPlan {
    /// Tick the client last pulled up to.
    pub since: i64,
    /// Snapshot boundary.
    pub until: i64,
    /// Facilities the client syncs for.
    pub facility_ids: Vec<String>,
    /// Restriction on pulled record types.
    pub tables_to_include: Option<Vec<String>>,
    /// Record types to resend from the beginning.
    pub tables_for_full_resync: Vec<String>,
    /// Send every lab request regardless of patient.
    pub sync_all_lab_requests: bool,
    /// Read from the lookup table.
    pub use_lookup: bool,
}

/// Patients a client is entitled to, split by when they were marked.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarkedPatients {
    /// Marked since the client's last pull; their whole history is sent.
    pub full: BTreeSet<String>,
    /// Marked before the client's last pull.
    pub incremental: BTreeSet<String>,
}

impl MarkedPatients {
    /// Every marked patient.
    pub fn all(&self) -> BTreeSet<String> {
        self.full.union(&self.incremental).cloned().collect()
    }
}

/// Result of a finished snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotOutcome {
    /// Snapshot boundary.
    pub pull_until: i64,
    /// Outgoing rows left after echo removal.
    pub outgoing: u64,
    /// Echoes removed.
    pub echoes_removed: usize,
}

struct Audience<'a> {
    patients: &'a BTreeSet<String>,
    facility_ids: &'a [String],
    all_lab_requests: bool,
}

impl Audience<'_> {
    fn admits(&self, patient_linked: bool, linkage: &Linkage) -> bool {
        if self.all_lab_requests && linkage.is_lab_request {
            return true;
        }
        if patient_linked {
            return linkage
                .patient_id
                .as_ref()
                .map_or(false, |p| self.patients.contains(p));
        }
        match &linkage.facility_id {
            Some(facility) => self.facility_ids.iter().any(|f| f == facility),
            None => true,
        }
    }
}

/// Slot in the snapshot concurrency limit, returned on drop.
pub struct SnapshotPermit {
    active: Arc<AtomicUsize>,
}

impl Drop for SnapshotPermit {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Builds session snapshots.
#[derive(Clone)]
pub struct SnapshotBuilder {
    db: Database,
    config: Arc<SyncConfig>,
    clock: SyncClock,
    sessions: SessionRegistry,
    models: Arc<ModelRegistry>,
    active: Arc<AtomicUsize>,
}

impl SnapshotBuilder {
    /// Creates a builder.
    pub fn new(
        db: Database,
        config: Arc<SyncConfig>,
        clock: SyncClock,
        sessions: SessionRegistry,
        models: Arc<ModelRegistry>,
    ) -> Self {
        Self {
            db,
            config,
            clock,
            sessions,
            models,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Snapshots currently holding a capacity slot.
    pub fn active_snapshots(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Waits until fewer than the configured number of snapshots run.
    pub async fn wait_for_capacity(&self, session_id: &str) -> SnapshotPermit {
        let max = self.config.max_concurrent_snapshots;
        let mut attempt = 0;
        loop {
            let current = self.active.load(Ordering::SeqCst);
            if current < max
                && self
                    .active
                    .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
            {
                return SnapshotPermit {
                    active: self.active.clone(),
                };
            }
            if attempt == 0 {
                debug!(session_id, active = current, max, "waiting for snapshot capacity");
            }
            tokio::time::sleep(self.config.poll_backoff.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }

    /// Builds the outgoing snapshot for a session.
    pub async fn build(
        &self,
        session_id: &str,
        since: i64,
        facility_ids: Vec<String>,
        tables_to_include: Option<Vec<String>>,
        tables_for_full_resync: Vec<String>,
    ) -> SyncResult<SnapshotOutcome> {
        let session = self.sessions.connect(session_id)?;
        let _permit = self.wait_for_capacity(session_id).await;
        self.sessions
            .update_open(session_id, |s| s.snapshot_started_at = Some(SystemTime::now()))?;
        let started = Instant::now();

        let until = self.clock.tick_tock()?.tick;
        self.clock.wait_for_pending_edits(until).await;

        let is_mobile = session.parameters.is_mobile;
        let plan = SnapshotPlan {
            since,
            until,
            facility_ids: if facility_ids.is_empty() {
                session.parameters.facility_ids.clone()
            } else {
                facility_ids
            },
            tables_to_include,
            tables_for_full_resync,
            sync_all_lab_requests: self.config.sync_all_lab_requests && !is_mobile && since > -1,
            use_lookup: self.config.lookup_table_enabled,
        };
        let (min_source_tick, max_source_tick) = self.source_window(&plan);
        self.sessions.update_open(session_id, |s| {
            s.pull_since = Some(since);
            s.pull_until = Some(until);
            s.parameters.facility_ids = plan.facility_ids.clone();
            s.parameters.tables_to_include = plan.tables_to_include.clone();
            s.parameters.tables_for_full_resync = plan.tables_for_full_resync.clone();
            s.parameters.sync_all_lab_requests = plan.sync_all_lab_requests;
            s.parameters.use_lookup_table = plan.use_lookup;
            s.parameters.min_source_tick = Some(min_source_tick);
            s.parameters.max_source_tick = Some(max_source_tick);
        })?;

        let work = self.snapshot_in_transaction(session_id, &plan);
        let (outgoing, echoes_removed) = match self.config.snapshot_transaction_timeout {
            Some(limit) => tokio::time::timeout(limit, work)
                .await
                .map_err(|_| SyncError::SnapshotTimedOut(session_id.to_string()))??,
            None => work.await?,
        };

        self.db.vacuum_snapshot_partition(session_id);
        if let Err(e) = self
            .sessions
            .update_open(session_id, |s| s.snapshot_completed_at = Some(SystemTime::now()))
        {
            // The session was closed under us; its partition must not linger.
            self.db.drop_snapshot_partition(session_id)?;
            return Err(e);
        }

        info!(
            session_id,
            since,
            until,
            outgoing,
            echoes_removed,
            use_lookup = plan.use_lookup,
            duration_ms = started.elapsed().as_millis() as u64,
            "snapshot complete"
        );
        Ok(SnapshotOutcome {
            pull_until: until,
            outgoing,
            echoes_removed,
        })
    }

    fn source_window(&self, plan: &SnapshotPlan) -> (i64, i64) {
        if !plan.use_lookup {
            return (plan.since, plan.until);
        }
        let txn = self.db.begin();
        let min = txn
            .lookup_ticks()
            .iter()
            .filter(|t| t.lookup_end_tick > plan.since)
            .map(|t| t.source_start_tick)
            .min()
            .unwrap_or(plan.since);
        let max = txn
            .fact(LOOKUP_UP_TO_TICK)
            .and_then(|v| v.parse().ok())
            .unwrap_or(plan.until);
        (min, max)
    }

    /// Runs both capture strategies' shared skeleton in one transaction.
    async fn snapshot_in_transaction(
        &self,
        session_id: &str,
        plan: &SnapshotPlan,
    ) -> SyncResult<(u64, usize)> {
        let mut txn = self.db.begin();
        let marked = self.marked_patients(&txn, plan);
        debug!(
            session_id,
            newly_marked = marked.full.len(),
            marked = marked.incremental.len(),
            "marked-for-sync patients resolved"
        );

        if plan.use_lookup {
            self.capture_from_lookup(&mut txn, session_id, plan, &marked)
                .await?;
        } else {
            self.capture_from_tables(&mut txn, session_id, plan, &marked)
                .await?;
        }
        let echoes_removed = self.remove_echoes(&mut txn, session_id)?;
        let outgoing = txn.count_snapshot(session_id, Some(SessionDirection::Outgoing));
        txn.commit()?;
        Ok((outgoing, echoes_removed))
    }

    /// Splits the patients marked for the plan's facilities.
    pub fn marked_patients(&self, txn: &Transaction, plan: &SnapshotPlan) -> MarkedPatients {
        let record_type = &self.config.patient_facilities_type;
        let chunk_size = self.config.max_records_per_snapshot_chunk;
        let mut marked = MarkedPatients::default();
        let mut after: Option<String> = None;
        loop {
            let chunk = txn.scan_records(record_type, after.as_deref(), chunk_size, |r| {
                !r.is_deleted
                    && r
                        .field_str("facility_id")
                        .map_or(false, |f| plan.facility_ids.iter().any(|id| id == f))
            });
            let Some(last) = chunk.last() else {
                break;
            };
            after = Some(last.id.clone());
            for record in &chunk {
                let Some(patient_id) = record.field_str("patient_id") else {
                    continue;
                };
                if record.updated_at_sync_tick > plan.since {
                    marked.full.insert(patient_id.to_string());
                } else {
                    marked.incremental.insert(patient_id.to_string());
                }
            }
        }
        marked
    }

    async fn capture_from_tables(
        &self,
        txn: &mut Transaction,
        session_id: &str,
        plan: &SnapshotPlan,
        marked: &MarkedPatients,
    ) -> SyncResult<()> {
        let tables = plan.tables_to_include.as_deref();

        // Whole history of newly marked patients.
        if !marked.full.is_empty() {
            let audience = Audience {
                patients: &marked.full,
                facility_ids: &plan.facility_ids,
                all_lab_requests: false,
            };
            for model in self.models.pullable(tables).filter(|m| m.is_patient_linked()) {
                self.capture_model(txn, session_id, model.as_ref(), -1, &audience)
                    .await?;
            }
        }

        let audience = Audience {
            patients: &marked.incremental,
            facility_ids: &plan.facility_ids,
            all_lab_requests: plan.sync_all_lab_requests,
        };
        for model in self.models.pullable(tables) {
            self.capture_model(txn, session_id, model.as_ref(), plan.since, &audience)
                .await?;
        }

        if !plan.tables_for_full_resync.is_empty() {
            let everyone = marked.all();
            let audience = Audience {
                patients: &everyone,
                facility_ids: &plan.facility_ids,
                all_lab_requests: plan.sync_all_lab_requests,
            };
            for model in self.models.pullable(Some(&plan.tables_for_full_resync)) {
                self.capture_model(txn, session_id, model.as_ref(), -1, &audience)
                    .await?;
            }
        }
        Ok(())
    }

    async fn capture_model(
        &self,
        txn: &mut Transaction,
        session_id: &str,
        model: &dyn SyncModel,
        since: i64,
        audience: &Audience<'_>,
    ) -> SyncResult<usize> {
        let record_type = model.record_type();
        let chunk_size = self.config.max_records_per_snapshot_chunk;
        let mut after: Option<String> = None;
        let mut inserted = 0;
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
                if !audience.admits(model.is_patient_linked(), &linkage) {
                    continue;
                }
                let row = NewSnapshotRow {
                    direction: SessionDirection::Outgoing,
                    record_type: record.record_type,
                    record_id: record.id,
                    is_deleted: record.is_deleted,
                    saved_at_sync_tick: record.updated_at_sync_tick,
                    source_sync_tick: record.updated_at_sync_tick,
                    updated_at_by_field_sum: updated_at_by_field_sum(&record.data),
                    data: record.data,
                };
                if txn.insert_snapshot_row(session_id, row)?.is_some() {
                    inserted += 1;
                }
            }
            tokio::task::yield_now().await;
        }
        debug!(session_id, record_type, since, inserted, "model captured");
        Ok(inserted)
    }

    async fn capture_from_lookup(
        &self,
        txn: &mut Transaction,
        session_id: &str,
        plan: &SnapshotPlan,
        marked: &MarkedPatients,
    ) -> SyncResult<usize> {
        let everyone = marked.all();
        let newly_marked = Audience {
            patients: &marked.full,
            facility_ids: &plan.facility_ids,
            all_lab_requests: false,
        };
        let incremental = Audience {
            patients: &marked.incremental,
            facility_ids: &plan.facility_ids,
            all_lab_requests: plan.sync_all_lab_requests,
        };
        let full_resync = Audience {
            patients: &everyone,
            facility_ids: &plan.facility_ids,
            all_lab_requests: plan.sync_all_lab_requests,
        };
        let tables = plan.tables_to_include.as_deref();
        let include = |entry: &LookupEntry| -> bool {
            if entry.updated_at_sync_tick == LOOKUP_PENDING_TICK {
                return false;
            }
            let Some(model) = self.models.get(&entry.record_type) else {
                return false;
            };
            let eligible = model.direction().can_pull()
                && tables.map_or(true, |t| t.iter().any(|name| name == &entry.record_type));
            if !eligible {
                return false;
            }
            let patient_linked = model.is_patient_linked();
            let linkage = Linkage {
                patient_id: entry.patient_id.clone(),
                facility_id: entry.facility_id.clone(),
                is_lab_request: entry.is_lab_request,
            };
            (patient_linked && newly_marked.admits(true, &linkage))
                || (entry.updated_at_sync_tick > plan.since
                    && incremental.admits(patient_linked, &linkage))
                || (plan
                    .tables_for_full_resync
                    .iter()
                    .any(|t| t == &entry.record_type)
                    && full_resync.admits(patient_linked, &linkage))
        };

        let chunk_size = self.config.max_records_per_snapshot_chunk;
        let mut after: Option<RecordKey> = None;
        let mut inserted = 0;
        loop {
            let chunk = txn.scan_lookup(after.as_ref(), chunk_size, include);
            let Some(last) = chunk.last() else {
                break;
            };
            after = Some((last.record_type.clone(), last.record_id.clone()));
            for entry in chunk {
                let row = NewSnapshotRow {
                    direction: SessionDirection::Outgoing,
                    record_type: entry.record_type,
                    record_id: entry.record_id,
                    is_deleted: entry.is_deleted,
                    saved_at_sync_tick: entry.updated_at_sync_tick,
                    source_sync_tick: entry.source_sync_tick,
                    updated_at_by_field_sum: entry.updated_at_by_field_sum,
                    data: entry.data,
                };
                if txn.insert_snapshot_row(session_id, row)?.is_some() {
                    inserted += 1;
                }
            }
            debug!(session_id, inserted, "lookup chunk captured");
            tokio::task::yield_now().await;
        }
        Ok(inserted)
    }

    /// Deletes outgoing rows that are the client's own pushes coming back.
    ///
    /// An outgoing row is an echo when an incoming row of the same record
    /// was saved at exactly the tick the outgoing row's source carries.
    pub fn remove_echoes(&self, txn: &mut Transaction, session_id: &str) -> SyncResult<usize> {
        let chunk_size = self.config.max_records_per_snapshot_chunk;
        let mut after = None;
        let mut removed = 0;
        loop {
            let chunk =
                txn.scan_snapshot(session_id, Some(SessionDirection::Incoming), after, chunk_size);
            let Some(last) = chunk.last() else {
                break;
            };
            after = Some(last.id);
            for incoming in chunk {
                let Some(outgoing_id) = txn.snapshot_row_id(
                    session_id,
                    SessionDirection::Outgoing,
                    &incoming.record_type,
                    &incoming.record_id,
                ) else {
                    continue;
                };
                let echoed = txn
                    .get_snapshot_row(session_id, outgoing_id)
                    .map_or(false, |out| out.source_sync_tick == incoming.saved_at_sync_tick);
                if echoed && txn.delete_snapshot_row(session_id, outgoing_id)? {
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            debug!(session_id, removed, "echoed changes removed");
        }
        Ok(removed)
    }

    /// Reads a page of outgoing rows, attaching changelog entries when the
    /// session recorded a source window.
    pub fn outgoing_page(
        &self,
        session_id: &str,
        from_id: Option<u64>,
        limit: usize,
    ) -> SyncResult<Vec<SyncRecord>> {
        let session = self.sessions.connect(session_id)?;
        let window = session
            .parameters
            .min_source_tick
            .zip(session.parameters.max_source_tick);
        let txn = self.db.begin();
        let rows = txn.scan_snapshot(
            session_id,
            Some(SessionDirection::Outgoing),
            from_id,
            limit.min(self.config.max_records_per_page),
        );
        Ok(rows
            .into_iter()
            .map(|row| {
                let mut record = row.into_sync_record();
                if let Some((min, max)) = window {
                    record.changelog_records =
                        txn.changelogs_for(&record.record_type, &record.record_id, min, max);
                }
                record
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locks::SyncLocks;
    use crate::models::SimpleModel;
    use serde_json::json;
    use std::time::Duration;
    use ticksync_protocol::{RecordData, SyncDirection};
    use ticksync_store::{Record, SessionParameters};

    fn data(value: serde_json::Value) -> RecordData {
        value.as_object().cloned().unwrap()
    }

    fn models() -> ModelRegistry {
        ModelRegistry::new()
            .register(SimpleModel::new("patients", SyncDirection::Bidirectional).patient_root())
            .register(
                SimpleModel::new("patient_facilities", SyncDirection::Bidirectional)
                    .with_patient_field("patient_id"),
            )
            .register(
                SimpleModel::new("encounters", SyncDirection::Bidirectional)
                    .with_patient_field("patient_id"),
            )
            .register(
                SimpleModel::new("locations", SyncDirection::PullFromCentral)
                    .with_facility_field("facility_id"),
            )
            .register(SimpleModel::new("reference_data", SyncDirection::PullFromCentral))
            .register(SimpleModel::new("device_logs", SyncDirection::PushToCentral))
    }

    struct Fixture {
        db: Database,
        sessions: SessionRegistry,
        builder: SnapshotBuilder,
    }

    fn fixture(config: SyncConfig) -> Fixture {
        let db = Database::new();
        let config = Arc::new(config);
        let clock = SyncClock::new(db.clone());
        let sessions =
            SessionRegistry::new(db.clone(), config.clone(), clock.clone(), SyncLocks::new(db.clone()));
        let builder =
            SnapshotBuilder::new(db.clone(), config, clock, sessions.clone(), Arc::new(models()));
        Fixture {
            db,
            sessions,
            builder,
        }
    }

    impl Fixture {
        fn put(&self, record_type: &str, id: &str, value: serde_json::Value) -> i64 {
            self.db
                .transaction(|txn| txn.put_record(Record::new(record_type, id, data(value))))
                .unwrap()
        }

        fn session(&self) -> String {
            let (id, marker) = self
                .sessions
                .start_session(SessionParameters {
                    device_id: "facility-1".into(),
                    facility_ids: vec!["f1".into()],
                    ..SessionParameters::default()
                })
                .unwrap();
            self.sessions.prepare_session(&id, marker).unwrap();
            id
        }

        fn outgoing_ids(&self, session_id: &str) -> Vec<String> {
            let mut ids: Vec<String> = self
                .builder
                .outgoing_page(session_id, None, usize::MAX)
                .unwrap()
                .into_iter()
                .map(|r| format!("{}/{}", r.record_type, r.record_id))
                .collect();
            ids.sort();
            ids
        }
    }

    #[tokio::test]
    async fn visibility_rules_apply() {
        let f = fixture(SyncConfig::new().with_chunk_size(2));
        f.put("patients", "p1", json!({}));
        f.put("patients", "p2", json!({}));
        f.put("patient_facilities", "pf1", json!({"patient_id": "p1", "facility_id": "f1"}));
        f.put("encounters", "e1", json!({"patient_id": "p1"}));
        f.put("encounters", "e2", json!({"patient_id": "p2"}));
        f.put("locations", "l1", json!({"facility_id": "f1"}));
        f.put("locations", "l2", json!({"facility_id": "f2"}));
        f.put("reference_data", "r1", json!({}));
        f.put("device_logs", "d1", json!({}));

        let session = f.session();
        let outcome = f
            .builder
            .build(&session, -1, vec![], None, vec![])
            .await
            .unwrap();
        assert_eq!(outcome.outgoing, 5);
        assert_eq!(
            f.outgoing_ids(&session),
            vec![
                "encounters/e1",
                "locations/l1",
                "patient_facilities/pf1",
                "patients/p1",
                "reference_data/r1",
            ]
        );
        let stored = f.sessions.get(&session).unwrap();
        assert_eq!(stored.pull_since, Some(-1));
        assert_eq!(stored.pull_until, Some(outcome.pull_until));
        assert!(stored.snapshot_completed_at.is_some());
    }

    #[tokio::test]
    async fn newly_marked_patient_gets_full_history() {
        let f = fixture(SyncConfig::new());
        f.put("patients", "p1", json!({}));
        f.put("encounters", "e1", json!({"patient_id": "p1"}));
        let since = f.db.begin().get_record("encounters", "e1").unwrap().updated_at_sync_tick + 1;
        f.builder.clock.tick_tock().unwrap();

        // Marked after the client's last pull.
        let marked_at = f.put("patient_facilities", "pf1", json!({"patient_id": "p1", "facility_id": "f1"}));
        assert!(marked_at > since);

        let session = f.session();
        f.builder.build(&session, since, vec![], None, vec![]).await.unwrap();
        let ids = f.outgoing_ids(&session);
        assert!(ids.contains(&"encounters/e1".to_string()));
        assert!(ids.contains(&"patients/p1".to_string()));
    }

    #[tokio::test]
    async fn incremental_pull_only_sends_newer_changes() {
        let f = fixture(SyncConfig::new());
        f.put("reference_data", "old", json!({}));
        let first = f.session();
        let outcome = f.builder.build(&first, -1, vec![], None, vec![]).await.unwrap();

        f.put("reference_data", "new", json!({}));
        let second = f.session();
        f.builder
            .build(&second, outcome.pull_until, vec![], None, vec![])
            .await
            .unwrap();
        assert_eq!(f.outgoing_ids(&second), vec!["reference_data/new"]);
    }

    #[tokio::test]
    async fn full_resync_resends_tables() {
        let f = fixture(SyncConfig::new());
        f.put("reference_data", "r1", json!({}));
        f.put("locations", "l1", json!({"facility_id": "f1"}));
        let since = f.db.counter(ticksync_store::CURRENT_SYNC_TICK).value().unwrap();

        let session = f.session();
        f.builder
            .build(&session, since, vec![], None, vec!["reference_data".into()])
            .await
            .unwrap();
        assert_eq!(f.outgoing_ids(&session), vec!["reference_data/r1"]);
    }

    #[tokio::test]
    async fn tables_to_include_restricts_models() {
        let f = fixture(SyncConfig::new());
        f.put("reference_data", "r1", json!({}));
        f.put("locations", "l1", json!({"facility_id": "f1"}));
        let session = f.session();
        f.builder
            .build(&session, -1, vec![], Some(vec!["locations".into()]), vec![])
            .await
            .unwrap();
        assert_eq!(f.outgoing_ids(&session), vec!["locations/l1"]);
    }

    #[tokio::test]
    async fn echoes_are_removed() {
        let f = fixture(SyncConfig::new());
        let session = f.session();
        let tick = f.put("reference_data", "r1", json!({}));
        f.put("reference_data", "r2", json!({}));
        f.db.transaction(|txn| {
            let id = txn
                .insert_snapshot_row(
                    &session,
                    NewSnapshotRow {
                        direction: SessionDirection::Incoming,
                        record_type: "reference_data".into(),
                        record_id: "r1".into(),
                        is_deleted: false,
                        saved_at_sync_tick: tick,
                        source_sync_tick: tick,
                        updated_at_by_field_sum: None,
                        data: RecordData::new(),
                    },
                )?
                .unwrap();
            Ok(id)
        })
        .unwrap();

        let outcome = f.builder.build(&session, -1, vec![], None, vec![]).await.unwrap();
        assert_eq!(outcome.echoes_removed, 1);
        assert_eq!(f.outgoing_ids(&session), vec!["reference_data/r2"]);
    }

    #[tokio::test]
    async fn capacity_is_bounded() {
        let f = fixture(
            SyncConfig::new()
                .with_max_concurrent_snapshots(1)
                .with_poll_backoff(crate::config::Backoff::fixed(Duration::from_millis(5))),
        );
        let held = f.builder.wait_for_capacity("a").await;
        assert_eq!(f.builder.active_snapshots(), 1);

        let builder = f.builder.clone();
        let waiter = tokio::spawn(async move { builder.wait_for_capacity("b").await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiter.is_finished());

        drop(held);
        let _second = waiter.await.unwrap();
        assert_eq!(f.builder.active_snapshots(), 1);
    }

    #[tokio::test]
    async fn snapshot_waits_for_in_flight_writer() {
        let f = fixture(SyncConfig::new());
        let session = f.session();

        let mut writer = f.db.begin();
        writer
            .put_record(Record::new("reference_data", "slow", RecordData::new()))
            .unwrap();

        let builder = f.builder.clone();
        let id = session.clone();
        let build = tokio::spawn(async move { builder.build(&id, -1, vec![], None, vec![]).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!build.is_finished());

        writer.commit().unwrap();
        build.await.unwrap().unwrap();
        assert_eq!(f.outgoing_ids(&session), vec!["reference_data/slow"]);
    }

    #[tokio::test]
    async fn changelogs_are_attached() {
        let f = fixture(SyncConfig::new());
        f.put("reference_data", "r1", json!({"v": 1}));
        f.put("reference_data", "r1", json!({"v": 2}));
        let session = f.session();
        f.builder.build(&session, -1, vec![], None, vec![]).await.unwrap();

        let page = f.builder.outgoing_page(&session, None, 10).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].changelog_records.len(), 2);
    }

    #[test]
    fn lab_request_override() {
        let patients = BTreeSet::new();
        let audience = Audience {
            patients: &patients,
            facility_ids: &[],
            all_lab_requests: true,
        };
        let lab = Linkage {
            patient_id: Some("p9".into()),
            facility_id: None,
            is_lab_request: true,
        };
        assert!(audience.admits(true, &lab));
        let not_lab = Linkage {
            is_lab_request: false,
            ..lab
        };
        assert!(!audience.admits(true, &not_lab));
    }
}
