#![allow(dead_code)]

use serde_json::{json, Value};
use std::time::Duration;
use ticksync_protocol::{
    EndSessionRequest, PageRequest, PullRequest, RecordData, SyncDirection, SyncRecord, SyncRequest,
};
use ticksync_server::{ModelRegistry, SimpleModel, SyncConfig, SyncManager, SyncModel, SyncResult};
use ticksync_store::{Database, Record, RecordKey, SnapshotRow, Transaction};

pub fn data(value: Value) -> RecordData {
    value.as_object().cloned().unwrap()
}

/// Rewrites colliding `code` values on push by appending a suffix.
pub struct LabelModel;

impl SyncModel for LabelModel {
    fn record_type(&self) -> &str {
        "labels"
    }

    fn direction(&self) -> SyncDirection {
        SyncDirection::Bidirectional
    }

    fn incoming_hook(
        &self,
        txn: &mut Transaction,
        incoming: &mut [SnapshotRow],
    ) -> SyncResult<Vec<RecordKey>> {
        let taken: Vec<(String, String)> = txn
            .scan_records("labels", None, usize::MAX, |_| true)
            .into_iter()
            .filter_map(|r| r.field_str("code").map(|c| (r.id.clone(), c.to_string())))
            .collect();
        let mut touched = Vec::new();
        for row in incoming {
            let Some(code) = row.data.get("code").and_then(Value::as_str).map(str::to_string) else {
                continue;
            };
            if taken.iter().any(|(id, c)| c == &code && id != &row.record_id) {
                row.data.insert("code".into(), json!(format!("{code}-1")));
                touched.push((row.record_type.clone(), row.record_id.clone()));
            }
        }
        Ok(touched)
    }
}

pub fn models() -> ModelRegistry {
    ModelRegistry::new()
        .register(SimpleModel::new("patients", SyncDirection::Bidirectional).patient_root())
        .register(
            SimpleModel::new("patient_facilities", SyncDirection::Bidirectional)
                .with_patient_field("patient_id")
                .with_facility_field("facility_id"),
        )
        .register(
            SimpleModel::new("encounters", SyncDirection::Bidirectional)
                .with_patient_field("patient_id")
                .with_facility_field("facility_id"),
        )
        .register(
            SimpleModel::new("lab_requests", SyncDirection::Bidirectional)
                .with_patient_via("encounter_id", "encounters")
                .lab_request(),
        )
        .register(
            SimpleModel::new("locations", SyncDirection::PullFromCentral)
                .with_facility_field("facility_id"),
        )
        .register(SimpleModel::new("reference_data", SyncDirection::PullFromCentral))
        .register(SimpleModel::new("notes", SyncDirection::Bidirectional))
        .register(SimpleModel::new("device_logs", SyncDirection::PushToCentral))
        .register(LabelModel)
}

pub fn config() -> SyncConfig {
    SyncConfig::new()
        .with_await_preparation(true)
        .with_stream_heartbeat(Duration::from_millis(2))
}

pub fn manager(db: &Database, config: SyncConfig) -> SyncManager {
    SyncManager::new(db.clone(), config, models()).unwrap()
}

pub fn put(db: &Database, record_type: &str, id: &str, value: Value) -> i64 {
    db.transaction(|txn| txn.put_record(Record::new(record_type, id, data(value))))
        .unwrap()
}

pub async fn admit(manager: &SyncManager, device: &str, facility_ids: &[&str]) -> String {
    let request = SyncRequest::new(
        device,
        0,
        facility_ids.iter().map(|f| f.to_string()).collect(),
    );
    let status = manager.check_sync_request(request).await.unwrap();
    status
        .session_id()
        .unwrap_or_else(|| panic!("{device} not admitted: {status:?}"))
        .to_string()
}

pub async fn wait_for(mut check: impl FnMut() -> SyncResult<bool>) {
    for _ in 0..1_000 {
        if check().unwrap() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition never held");
}

/// Initiates a pull, waits for it and pages through every record.
pub async fn pull(manager: &SyncManager, session_id: &str, request: PullRequest) -> Vec<SyncRecord> {
    manager.initiate_pull(session_id, request).unwrap();
    wait_for(|| manager.check_pull_ready(session_id)).await;
    let mut records = Vec::new();
    let mut from_id = None;
    loop {
        let page = manager
            .get_outgoing_changes(session_id, PageRequest::new(from_id, 7))
            .unwrap();
        let Some(next) = page.next_from_id() else {
            break;
        };
        from_id = Some(next);
        records.extend(page.records);
    }
    records
}

/// Runs a whole pull-only session and ends it.
pub async fn pull_session(
    manager: &SyncManager,
    device: &str,
    facility_ids: &[&str],
    request: PullRequest,
) -> Vec<SyncRecord> {
    let session_id = admit(manager, device, facility_ids).await;
    let records = pull(manager, &session_id, request).await;
    manager
        .end_session(&session_id, EndSessionRequest::default())
        .unwrap();
    records
}

/// `(type/id, deleted)` pairs, sorted.
pub fn keys(records: &[SyncRecord]) -> Vec<(String, bool)> {
    let mut keys: Vec<_> = records
        .iter()
        .map(|r| (format!("{}/{}", r.record_type, r.record_id), r.is_deleted))
        .collect();
    keys.sort();
    keys
}
