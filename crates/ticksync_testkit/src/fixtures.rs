//! Test fixtures and center helpers.
//!
//! Provides a healthcare model set, an in-process center with automatic
//! cleanup and helpers for seeding and syncing test devices.

use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;
use ticksync_client::{ClientConfig, LoopbackTransport, MemoryClientStore, RetryConfig, SyncClient};
use ticksync_protocol::{RecordData, SyncChange, SyncDirection};
use ticksync_server::{ModelRegistry, SimpleModel, SyncConfig, SyncModel, SyncResult, SyncServer};
use ticksync_store::{Database, Record, RecordKey, SnapshotRow, StoreOptions, Transaction};

/// A client driving a device against a [`TestCenter`].
pub type TestClient = SyncClient<LoopbackTransport, MemoryClientStore>;

/// Converts a JSON object into record data.
///
/// # Panics
///
/// Panics if `value` is not an object.
pub fn data(value: Value) -> RecordData {
    match value {
        Value::Object(map) => map,
        other => panic!("record data must be an object, got {other}"),
    }
}

/// A local upsert for a test device.
pub fn put_change(record_type: &str, record_id: &str, value: Value) -> SyncChange {
    SyncChange::put(record_type, record_id, data(value))
}

/// Patients whose pushed `display_id` is already taken get a suffixed one.
///
/// The renamed patient is sent back to the pushing device in the same
/// session.
pub struct PatientModel;

impl SyncModel for PatientModel {
    fn record_type(&self) -> &str {
        "patients"
    }

    fn direction(&self) -> SyncDirection {
        SyncDirection::Bidirectional
    }

    fn is_patient_linked(&self) -> bool {
        true
    }

    fn linkage(&self, record: &Record, _txn: &Transaction, _models: &ModelRegistry) -> ticksync_server::Linkage {
        ticksync_server::Linkage {
            patient_id: Some(record.id.clone()),
            ..Default::default()
        }
    }

    fn incoming_hook(
        &self,
        txn: &mut Transaction,
        incoming: &mut [SnapshotRow],
    ) -> SyncResult<Vec<RecordKey>> {
        let mut renamed = Vec::new();
        for row in incoming.iter_mut() {
            let Some(display_id) = row.data.get("display_id").and_then(Value::as_str).map(str::to_string) else {
                continue;
            };
            let clash = txn
                .scan_records("patients", None, 1, |r| {
                    r.id != row.record_id && r.field_str("display_id") == Some(display_id.as_str())
                })
                .into_iter()
                .next()
                .is_some();
            if clash {
                row.data
                    .insert("display_id".into(), json!(format!("{display_id}-{}", row.record_id)));
                renamed.push((row.record_type.clone(), row.record_id.clone()));
            }
        }
        Ok(renamed)
    }
}

/// The model set used across the testkit.
///
/// Patients and their facility markers, encounters and lab requests are
/// patient-linked; locations are per facility; reference data and notes
/// reach every device; device logs only flow to the center.
pub fn healthcare_models() -> ModelRegistry {
    ModelRegistry::new()
        .register(PatientModel)
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
}

/// A server configuration tuned for tests: prepared sessions and a fast
/// heartbeat.
pub fn test_config() -> SyncConfig {
    SyncConfig::new()
        .with_await_preparation(true)
        .with_stream_heartbeat(Duration::from_millis(2))
}

/// A client configuration that retries quickly.
pub fn test_client_config(device_id: &str, facilities: &[&str]) -> ClientConfig {
    ClientConfig::new(device_id)
        .with_facilities(facilities.iter().map(|f| f.to_string()).collect())
        .with_admission(RetryConfig::fixed(2_000, Duration::from_millis(2)))
        .with_polling(RetryConfig::fixed(1_000, Duration::from_millis(2)))
}

/// An in-process center with automatic cleanup.
pub struct TestCenter {
    /// The server.
    pub server: SyncServer,
    config: SyncConfig,
    _temp_dir: Option<TempDir>,
}

impl TestCenter {
    /// Creates a center over an empty in-memory database.
    pub fn memory() -> Self {
        Self::with_config(test_config())
    }

    /// Creates a center with a custom configuration.
    pub fn with_config(config: SyncConfig) -> Self {
        Self::open(Database::new(), config, None)
    }

    /// Creates a center whose state can be checkpointed to a temporary
    /// directory and reopened with [`restart`](Self::restart).
    pub fn file() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        Self::open(Database::new(), test_config(), Some(temp_dir))
    }

    fn open(db: Database, config: SyncConfig, temp_dir: Option<TempDir>) -> Self {
        let server =
            SyncServer::new(db, config.clone(), healthcare_models()).expect("Failed to create server");
        Self {
            server,
            config,
            _temp_dir: temp_dir,
        }
    }

    /// Returns the checkpoint path if file-based, None if in-memory.
    pub fn path(&self) -> Option<PathBuf> {
        self._temp_dir
            .as_ref()
            .map(|d| d.path().join("center.json"))
    }

    /// Checkpoints the database and reopens the center from the checkpoint.
    ///
    /// # Panics
    ///
    /// Panics if the center is in-memory.
    pub fn restart(self) -> Self {
        let path = self.path().expect("Only file centers can restart");
        self.server
            .manager()
            .db()
            .checkpoint(&path)
            .expect("Failed to write checkpoint");
        let Self {
            server,
            config,
            _temp_dir,
        } = self;
        drop(server);
        let db = Database::restore(&path, StoreOptions::default()).expect("Failed to restore checkpoint");
        Self::open(db, config, _temp_dir)
    }

    /// The database behind the center.
    pub fn db(&self) -> &Database {
        self.server.manager().db()
    }

    /// Writes a record directly at the center and returns its tick.
    pub fn put(&self, record_type: &str, id: &str, value: Value) -> i64 {
        self.db()
            .transaction(|txn| txn.put_record(Record::new(record_type, id, data(value))))
            .expect("Failed to put record")
    }

    /// Soft-deletes a record at the center.
    pub fn delete(&self, record_type: &str, id: &str) {
        self.db()
            .transaction(|txn| txn.delete_record(record_type, id))
            .expect("Failed to delete record");
    }

    /// Reads a live record.
    pub fn get(&self, record_type: &str, id: &str) -> Option<Record> {
        self.db().begin().get_record(record_type, id)
    }

    /// Ids of the live, non-deleted records of `record_type`, sorted.
    pub fn ids(&self, record_type: &str) -> Vec<String> {
        self.db()
            .begin()
            .scan_records(record_type, None, usize::MAX, |r| !r.is_deleted)
            .into_iter()
            .map(|r| r.id)
            .collect()
    }

    /// Creates a client for a device serving `facilities`.
    pub fn client(&self, device_id: &str, facilities: &[&str]) -> TestClient {
        SyncClient::new(
            test_client_config(device_id, facilities),
            LoopbackTransport::from_server(&self.server),
            MemoryClientStore::new(),
        )
    }
}

impl std::ops::Deref for TestCenter {
    type Target = SyncServer;

    fn deref(&self) -> &Self::Target {
        &self.server
    }
}

/// Runs a test with a temporary in-memory center.
pub fn with_test_center<F, R>(f: F) -> R
where
    F: FnOnce(&TestCenter) -> R,
{
    let center = TestCenter::memory();
    f(&center)
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;

    /// Seeds a two-facility clinic.
    ///
    /// - `p1` is marked for `f1`, `p2` for `f2`, `p3` is unmarked
    /// - encounters `e1`..`e3` all happened at `f1`
    /// - lab request `lr1` belongs to `p3`, `lr2` to `p1`
    /// - one location per facility, one reference row, two notes (`n2`
    ///   deleted)
    pub fn clinic(center: &TestCenter) {
        for p in ["p1", "p2", "p3"] {
            center.put("patients", p, json!({"display_id": p.to_uppercase()}));
        }
        center.put("patient_facilities", "pf1", json!({"patient_id": "p1", "facility_id": "f1"}));
        center.put("patient_facilities", "pf2", json!({"patient_id": "p2", "facility_id": "f2"}));
        for (e, p) in [("e1", "p1"), ("e2", "p2"), ("e3", "p3")] {
            center.put("encounters", e, json!({"patient_id": p, "facility_id": "f1"}));
        }
        center.put("lab_requests", "lr1", json!({"encounter_id": "e3"}));
        center.put("lab_requests", "lr2", json!({"encounter_id": "e1"}));
        center.put("locations", "l1", json!({"facility_id": "f1"}));
        center.put("locations", "l2", json!({"facility_id": "f2"}));
        center.put("reference_data", "r1", json!({"code": "ICD-1"}));
        center.put("notes", "n1", json!({"text": "hello"}));
        center.put("notes", "n2", json!({"text": "bye"}));
        center.delete("notes", "n2");
    }

    /// Creates a center holding `count` notes.
    pub fn populated_center(count: usize) -> TestCenter {
        let center = TestCenter::memory();
        for i in 0..count {
            center.put("notes", &format!("n{i:05}"), json!({"index": i}));
        }
        center
    }
}
