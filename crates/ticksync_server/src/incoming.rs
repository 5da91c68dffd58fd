//! Receiving pushed changes and persisting them to the live tables.

use crate::clock::SyncClock;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::locks::ProcessingMarker;
use crate::lookup::now_millis;
use crate::models::{ModelRegistry, SyncModel};
use crate::session::SessionRegistry;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use ticksync_protocol::{SessionDirection, SyncChange};
use ticksync_store::{Database, NewSnapshotRow, Record, RecordKey, SnapshotRow, SyncSession};
use tracing::{debug, error, info};

/// Result of persisting a session's pushed changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistOutcome {
    /// Rows written to live tables.
    pub persisted: usize,
    /// Tick the push was committed at.
    pub tock: i64,
    /// Records rewritten by hooks and stamped again after the push.
    pub restamped: usize,
}

/// Stages pushed changes and applies them.
#[derive(Clone)]
pub struct IncomingApplier {
    db: Database,
    config: Arc<SyncConfig>,
    clock: SyncClock,
    sessions: SessionRegistry,
    models: Arc<ModelRegistry>,
}

impl IncomingApplier {
    /// Creates an applier.
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
        }
    }

    /// Stages a batch of pushed changes in the session's partition.
    ///
    /// A change to an unknown or pull-only model errors the session. A change
    /// pushed twice replaces the staged copy.
    pub fn add_incoming_changes(&self, session_id: &str, changes: &[SyncChange]) -> SyncResult<usize> {
        self.sessions.connect(session_id)?;
        for change in changes {
            if let Err(e) = self.check_pushable(change) {
                self.sessions.add_debug_info(
                    session_id,
                    json!({
                        "rejectedRecord": {
                            "recordType": change.record_type,
                            "recordId": change.record_id,
                        }
                    }),
                )?;
                self.sessions.mark_errored(session_id, &e.to_string())?;
                return Err(e);
            }
        }

        let mut txn = self.db.begin();
        for change in changes {
            let existing = txn.snapshot_row_id(
                session_id,
                SessionDirection::Incoming,
                &change.record_type,
                &change.record_id,
            );
            match existing.and_then(|id| txn.get_snapshot_row(session_id, id)) {
                Some(mut row) => {
                    row.is_deleted = change.is_deleted;
                    row.updated_at_by_field_sum = change.updated_at_by_field_sum();
                    row.data = change.data.clone();
                    txn.update_snapshot_row(row)?;
                }
                None => {
                    txn.insert_snapshot_row(
                        session_id,
                        NewSnapshotRow {
                            direction: SessionDirection::Incoming,
                            record_type: change.record_type.clone(),
                            record_id: change.record_id.clone(),
                            is_deleted: change.is_deleted,
                            saved_at_sync_tick: 0,
                            source_sync_tick: 0,
                            updated_at_by_field_sum: change.updated_at_by_field_sum(),
                            data: change.data.clone(),
                        },
                    )?;
                }
            }
        }
        txn.commit()?;
        debug!(session_id, count = changes.len(), "incoming changes staged");
        Ok(changes.len())
    }

    fn check_pushable(&self, change: &SyncChange) -> SyncResult<()> {
        let model = self
            .models
            .get(&change.record_type)
            .ok_or_else(|| SyncError::UnknownModel {
                record_type: change.record_type.clone(),
                record_id: change.record_id.clone(),
            })?;
        if !model.direction().can_push() {
            return Err(SyncError::DisallowedPush {
                record_type: change.record_type.clone(),
                record_id: change.record_id.clone(),
            });
        }
        Ok(())
    }

    /// Number of staged incoming rows.
    pub fn count_incoming(&self, session_id: &str) -> u64 {
        self.db
            .begin()
            .count_snapshot(session_id, Some(SessionDirection::Incoming))
    }

    /// Writes every staged change to the live tables.
    ///
    /// Failures are recorded on the session. The marker is released when
    /// persistence finishes either way.
    pub fn persist(
        &self,
        session_id: &str,
        device_id: &str,
        tables_to_include: Option<&[String]>,
        marker: ProcessingMarker,
    ) -> SyncResult<PersistOutcome> {
        let result = self.persist_inner(session_id, device_id, tables_to_include);
        marker.release();
        match &result {
            Ok(outcome) => {
                self.sessions
                    .update_open(session_id, |s| s.persist_completed_at = Some(SystemTime::now()))?;
                info!(
                    session_id,
                    persisted = outcome.persisted,
                    tock = outcome.tock,
                    restamped = outcome.restamped,
                    "push persisted"
                );
            }
            Err(e) => {
                error!(session_id, error = %e, "push persistence failed");
                self.sessions.mark_errored(session_id, &e.to_string())?;
            }
        }
        result
    }

    fn persist_inner(
        &self,
        session_id: &str,
        device_id: &str,
        tables_to_include: Option<&[String]>,
    ) -> SyncResult<PersistOutcome> {
        let session = self.sessions.connect(session_id)?;
        if device_id != session.parameters.device_id {
            return Err(SyncError::InvalidRequest(format!(
                "session {session_id} belongs to device {}",
                session.parameters.device_id
            )));
        }
        let total = self.count_incoming(session_id);
        self.sessions.add_debug_info(
            session_id,
            json!({ "beganPersistAt": now_millis(), "totalPushed": total }),
        )?;
        let started = Instant::now();

        let models: Vec<Arc<dyn SyncModel>> =
            self.models.pushable(tables_to_include).cloned().collect();
        let (tock, persisted, per_model, touched) = self.save_incoming(&session, &models)?;

        self.db
            .transaction(|txn| txn.insert_device_tick(device_id, tock))?;

        if !per_model.is_empty() {
            let mut txn = self.db.begin();
            for (model, ids) in &per_model {
                model.adjust_post_push(&mut txn, ids)?;
            }
            txn.commit()?;
        }

        let restamped = self.restamp(&touched)?;
        debug!(
            session_id,
            duration_ms = started.elapsed().as_millis() as u64,
            "persist finished"
        );
        Ok(PersistOutcome {
            persisted,
            tock,
            restamped,
        })
    }

    #[allow(clippy::type_complexity)]
    fn save_incoming(
        &self,
        session: &SyncSession,
        models: &[Arc<dyn SyncModel>],
    ) -> SyncResult<(i64, usize, Vec<(Arc<dyn SyncModel>, Vec<String>)>, Vec<RecordKey>)> {
        let session_id = session.id.as_str();
        let mut txn = self.db.begin();
        if !session.parameters.is_mobile {
            // Facility servers send their own changelog entries.
            txn.pause_audit();
        }
        let tock = self.clock.tick_tock_holding(&txn)?.tock;

        let mut by_type = self.staged_by_type(session_id);
        let mut persisted = 0;
        let mut per_model = Vec::new();
        let mut touched = Vec::new();
        for model in models {
            let Some(mut rows) = by_type.remove(model.record_type()) else {
                continue;
            };
            touched.extend(model.incoming_hook(&mut txn, &mut rows)?);

            let mut ids = Vec::with_capacity(rows.len());
            for mut row in rows {
                let mut record = Record::new(&row.record_type, &row.record_id, row.data.clone());
                if row.is_deleted {
                    if let Some(existing) = txn.get_record(&row.record_type, &row.record_id) {
                        if row.data.is_empty() {
                            record.data = existing.data;
                        }
                    }
                    record.is_deleted = true;
                }
                txn.put_record_at(record, tock)?;
                ids.push(row.record_id.clone());
                row.saved_at_sync_tick = tock;
                txn.update_snapshot_row(row)?;
            }
            debug!(session_id, record_type = model.record_type(), count = ids.len(), "model persisted");
            persisted += ids.len();
            per_model.push((model.clone(), ids));
        }
        if !by_type.is_empty() {
            debug!(
                session_id,
                skipped = ?by_type.keys().collect::<Vec<_>>(),
                "staged types outside the push scope left unsaved"
            );
        }
        // Anything the hooks changed must sort after this batch.
        self.clock.tick_tock()?;
        txn.commit()?;
        Ok((tock, persisted, per_model, touched))
    }

    fn staged_by_type(&self, session_id: &str) -> BTreeMap<String, Vec<SnapshotRow>> {
        let txn = self.db.begin();
        let chunk_size = self.config.max_records_per_snapshot_chunk;
        let mut by_type: BTreeMap<String, Vec<SnapshotRow>> = BTreeMap::new();
        let mut after = None;
        loop {
            let chunk =
                txn.scan_snapshot(session_id, Some(SessionDirection::Incoming), after, chunk_size);
            let Some(last) = chunk.last() else {
                break;
            };
            after = Some(last.id);
            for row in chunk {
                by_type.entry(row.record_type.clone()).or_default().push(row);
            }
        }
        by_type
    }

    /// Stamps hook-touched records with a fresh tick so the pushing device
    /// receives their final state.
    fn restamp(&self, keys: &[RecordKey]) -> SyncResult<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut txn = self.db.begin();
        let mut restamped = 0;
        for (record_type, record_id) in keys {
            if let Some(record) = txn.get_record(record_type, record_id) {
                txn.put_record(record)?;
                restamped += 1;
            }
        }
        txn.commit()?;
        Ok(restamped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locks::SyncLocks;
    use crate::models::SimpleModel;
    use ticksync_protocol::{RecordData, SyncDirection};
    use ticksync_store::SessionParameters;

    fn data(value: serde_json::Value) -> RecordData {
        value.as_object().cloned().unwrap()
    }

    /// Uppercases every pushed `name` and reports the rewritten records.
    struct ShoutingModel;

    impl SyncModel for ShoutingModel {
        fn record_type(&self) -> &str {
            "shouts"
        }

        fn direction(&self) -> SyncDirection {
            SyncDirection::Bidirectional
        }

        fn incoming_hook(
            &self,
            _txn: &mut ticksync_store::Transaction,
            incoming: &mut [SnapshotRow],
        ) -> SyncResult<Vec<RecordKey>> {
            let mut touched = Vec::new();
            for row in incoming {
                if let Some(name) = row.data.get("name").and_then(|v| v.as_str()) {
                    let upper = name.to_uppercase();
                    if upper != name {
                        row.data.insert("name".into(), upper.into());
                        touched.push((row.record_type.clone(), row.record_id.clone()));
                    }
                }
            }
            Ok(touched)
        }
    }

    struct Fixture {
        db: Database,
        sessions: SessionRegistry,
        locks: SyncLocks,
        applier: IncomingApplier,
    }

    fn fixture() -> Fixture {
        let db = Database::new();
        let config = Arc::new(SyncConfig::new());
        let clock = SyncClock::new(db.clone());
        let locks = SyncLocks::new(db.clone());
        let sessions = SessionRegistry::new(db.clone(), config.clone(), clock.clone(), locks.clone());
        let models = ModelRegistry::new()
            .register(SimpleModel::new("encounters", SyncDirection::Bidirectional))
            .register(SimpleModel::new("reference_data", SyncDirection::PullFromCentral))
            .register(ShoutingModel);
        let applier = IncomingApplier::new(db.clone(), config, clock, sessions.clone(), Arc::new(models));
        Fixture {
            db,
            sessions,
            locks,
            applier,
        }
    }

    impl Fixture {
        fn session(&self) -> String {
            let (id, marker) = self
                .sessions
                .start_session(SessionParameters {
                    device_id: "dev-1".into(),
                    ..SessionParameters::default()
                })
                .unwrap();
            self.sessions.prepare_session(&id, marker).unwrap();
            id
        }

        fn persist(&self, session_id: &str) -> SyncResult<PersistOutcome> {
            let marker = self.locks.mark_processing(session_id).unwrap().unwrap();
            self.applier.persist(session_id, "dev-1", None, marker)
        }
    }

    #[test]
    fn staged_changes_are_persisted_at_one_tock() {
        let f = fixture();
        let session = f.session();
        f.applier
            .add_incoming_changes(
                &session,
                &[
                    SyncChange::put("encounters", "e1", data(json!({"n": 1}))),
                    SyncChange::put("encounters", "e2", data(json!({"n": 2}))),
                ],
            )
            .unwrap();
        // A re-sent change replaces the staged copy.
        f.applier
            .add_incoming_changes(&session, &[SyncChange::put("encounters", "e1", data(json!({"n": 3})))])
            .unwrap();
        assert_eq!(f.applier.count_incoming(&session), 2);

        let outcome = f.persist(&session).unwrap();
        assert_eq!(outcome.persisted, 2);

        let txn = f.db.begin();
        let e1 = txn.get_record("encounters", "e1").unwrap();
        assert_eq!(e1.data["n"], 3);
        assert_eq!(e1.updated_at_sync_tick, outcome.tock);
        assert_eq!(txn.get_record("encounters", "e2").unwrap().updated_at_sync_tick, outcome.tock);
        assert!(txn
            .scan_snapshot(&session, Some(SessionDirection::Incoming), None, 10)
            .iter()
            .all(|row| row.saved_at_sync_tick == outcome.tock));
        assert_eq!(txn.device_ticks()[0].persisted_at_sync_tick, outcome.tock);

        let stored = f.sessions.get(&session).unwrap();
        assert!(stored.persist_completed_at.is_some());
        assert_eq!(stored.debug_info["totalPushed"], 2);
        assert!(!f.locks.is_processing(&session));
    }

    #[test]
    fn pull_only_push_errors_session() {
        let f = fixture();
        let session = f.session();
        let err = f
            .applier
            .add_incoming_changes(&session, &[SyncChange::put("reference_data", "r1", RecordData::new())])
            .unwrap_err();
        assert!(err.is_security_violation());

        let stored = f.sessions.get(&session).unwrap();
        assert!(stored.is_errored());
        assert_eq!(stored.debug_info["rejectedRecord"]["recordType"], "reference_data");
        assert!(f.applier.add_incoming_changes(&session, &[]).is_err());
    }

    #[test]
    fn unknown_model_is_rejected() {
        let f = fixture();
        let session = f.session();
        let err = f
            .applier
            .add_incoming_changes(&session, &[SyncChange::put("mystery", "m1", RecordData::new())])
            .unwrap_err();
        assert!(matches!(err, SyncError::UnknownModel { .. }));
        assert_eq!(f.applier.count_incoming(&session), 0);
    }

    #[test]
    fn delete_keeps_last_known_data() {
        let f = fixture();
        f.db.transaction(|txn| txn.put_record(Record::new("encounters", "e1", data(json!({"n": 1})))))
            .unwrap();
        let session = f.session();
        f.applier
            .add_incoming_changes(&session, &[SyncChange::delete("encounters", "e1")])
            .unwrap();
        f.persist(&session).unwrap();

        let record = f.db.begin().get_record("encounters", "e1").unwrap();
        assert!(record.is_deleted);
        assert_eq!(record.data["n"], 1);
    }

    #[test]
    fn hook_rewrites_are_restamped() {
        let f = fixture();
        let session = f.session();
        f.applier
            .add_incoming_changes(
                &session,
                &[
                    SyncChange::put("shouts", "s1", data(json!({"name": "hello"}))),
                    SyncChange::put("shouts", "s2", data(json!({"name": "LOUD"}))),
                ],
            )
            .unwrap();
        let outcome = f.persist(&session).unwrap();
        assert_eq!(outcome.restamped, 1);

        let txn = f.db.begin();
        let s1 = txn.get_record("shouts", "s1").unwrap();
        assert_eq!(s1.data["name"], "HELLO");
        assert!(s1.updated_at_sync_tick > outcome.tock);
        assert_eq!(txn.get_record("shouts", "s2").unwrap().updated_at_sync_tick, outcome.tock);
    }

    #[test]
    fn wrong_device_errors_session() {
        let f = fixture();
        let session = f.session();
        let marker = f.locks.mark_processing(&session).unwrap().unwrap();
        let err = f.applier.persist(&session, "someone-else", None, marker).unwrap_err();
        assert!(matches!(err, SyncError::InvalidRequest(_)));
        assert!(f.sessions.get(&session).unwrap().is_errored());
    }
}
