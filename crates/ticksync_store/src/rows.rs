//! Row types of the store's tables.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, SystemTime};
use ticksync_protocol::{RecordData, SessionDirection, SyncRecord};

/// A row of a live, syncable model table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Model name.
    pub record_type: String,
    /// Primary key.
    pub id: String,
    /// Column data.
    pub data: RecordData,
    /// Soft-delete flag.
    pub is_deleted: bool,
    /// Tick of the last write; stamped by the store on every put.
    pub updated_at_sync_tick: i64,
}

impl Record {
    /// Creates a live record. The sync tick is assigned on write.
    pub fn new(record_type: impl Into<String>, id: impl Into<String>, data: RecordData) -> Self {
        Self {
            record_type: record_type.into(),
            id: id.into(),
            data,
            is_deleted: false,
            updated_at_sync_tick: 0,
        }
    }

    /// Returns a string column.
    pub fn field_str(&self, field: &str) -> Option<&str> {
        self.data.get(field).and_then(Value::as_str)
    }

    /// Returns the key of the record.
    pub fn key(&self) -> (String, String) {
        (self.record_type.clone(), self.id.clone())
    }
}

/// A denormalized copy of a syncable record with its routing attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LookupEntry {
    /// Model name.
    pub record_type: String,
    /// Primary key.
    pub record_id: String,
    /// Owning patient, if the record is patient-linked.
    pub patient_id: Option<String>,
    /// Owning facility, if the record is facility-linked.
    pub facility_id: Option<String>,
    /// Routing hint for the "all lab requests" override.
    pub is_lab_request: bool,
    /// Soft-delete flag.
    pub is_deleted: bool,
    /// Tick the entry was refreshed at; the pending sentinel while unresolved.
    pub updated_at_sync_tick: i64,
    /// Tick of the source record when it was copied.
    pub source_sync_tick: i64,
    /// Per-field update checksum of the source record.
    pub updated_at_by_field_sum: Option<i64>,
    /// Column data of the source record.
    pub data: RecordData,
}

/// A row of a session's snapshot partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRow {
    /// Row id, unique across all partitions and increasing in insert order.
    pub id: u64,
    /// Owning session.
    pub session_id: String,
    /// Incoming or outgoing.
    pub direction: SessionDirection,
    /// Model name.
    pub record_type: String,
    /// Primary key of the record.
    pub record_id: String,
    /// Soft-delete flag.
    pub is_deleted: bool,
    /// For outgoing rows the tick the change was captured at; for incoming
    /// rows the commit tick once persisted.
    pub saved_at_sync_tick: i64,
    /// Tick of the live record the row was captured from.
    pub source_sync_tick: i64,
    /// Per-field update checksum.
    pub updated_at_by_field_sum: Option<i64>,
    /// Column data.
    pub data: RecordData,
}

/// Values for a new snapshot row; the id is assigned on insert.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSnapshotRow {
    /// Incoming or outgoing.
    pub direction: SessionDirection,
    /// Model name.
    pub record_type: String,
    /// Primary key of the record.
    pub record_id: String,
    /// Soft-delete flag.
    pub is_deleted: bool,
    /// Captured or committed tick.
    pub saved_at_sync_tick: i64,
    /// Tick of the source record.
    pub source_sync_tick: i64,
    /// Per-field update checksum.
    pub updated_at_by_field_sum: Option<i64>,
    /// Column data.
    pub data: RecordData,
}

impl SnapshotRow {
    /// Converts the row into the record delivered to a client.
    pub fn into_sync_record(self) -> SyncRecord {
        SyncRecord {
            id: self.id,
            record_type: self.record_type,
            record_id: self.record_id,
            is_deleted: self.is_deleted,
            data: self.data,
            saved_at_sync_tick: self.saved_at_sync_tick,
            changelog_records: Vec::new(),
        }
    }
}

/// The source range covered by one lookup refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupTick {
    /// Row id.
    pub id: u64,
    /// Cutoff of the previous refresh.
    pub source_start_tick: i64,
    /// Tick the refreshed entries were resolved to.
    pub lookup_end_tick: i64,
}

/// The tick a device's push was persisted at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceTick {
    /// Row id.
    pub id: u64,
    /// Device that pushed.
    pub device_id: String,
    /// Commit tick of the push.
    pub persisted_at_sync_tick: i64,
}

/// A free-form diagnostic log row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugLog {
    /// Row id.
    pub id: u64,
    /// Category, e.g. `syncLookupUpdate`.
    pub log_type: String,
    /// Structured details.
    pub info: Value,
    /// Creation time.
    pub created_at: SystemTime,
}

/// Parameters a session was started with.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionParameters {
    /// Device that owns the session.
    pub device_id: String,
    /// Facilities the device serves.
    pub facility_ids: Vec<String>,
    /// Whether the device is a mobile client.
    pub is_mobile: bool,
    /// Models the pull is restricted to.
    pub tables_to_include: Option<Vec<String>>,
    /// Models resent in full.
    pub tables_for_full_resync: Vec<String>,
    /// Whether every lab request is sent regardless of patient.
    pub sync_all_lab_requests: bool,
    /// Whether the snapshot was built from the lookup table.
    pub use_lookup_table: bool,
    /// Exclusive lower bound of attached changelog entries.
    pub min_source_tick: Option<i64>,
    /// Inclusive upper bound of attached changelog entries.
    pub max_source_tick: Option<i64>,
}

/// One client sync attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSession {
    /// Opaque session id.
    pub id: String,
    /// Row creation time.
    pub created_at: SystemTime,
    /// Time the session was started.
    pub start_time: SystemTime,
    /// Last time a client operation touched the session.
    pub last_connection_time: SystemTime,
    /// Tick taken when preparation completed.
    pub started_at_tick: Option<i64>,
    /// Pull lower bound.
    pub pull_since: Option<i64>,
    /// Pull upper bound.
    pub pull_until: Option<i64>,
    /// Snapshot start time.
    pub snapshot_started_at: Option<SystemTime>,
    /// Snapshot completion time.
    pub snapshot_completed_at: Option<SystemTime>,
    /// Push persistence completion time.
    pub persist_completed_at: Option<SystemTime>,
    /// Completion time, set for both success and error.
    pub completed_at: Option<SystemTime>,
    /// Append-only list of failure reasons.
    pub errors: Vec<String>,
    /// Start parameters.
    pub parameters: SessionParameters,
    /// Free-form diagnostics.
    pub debug_info: serde_json::Map<String, Value>,
}

/// Lifecycle phase derived from a session's timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// Row inserted, preparation pending.
    Created,
    /// Clock ticked, ready for pull or push.
    Prepared,
    /// Snapshot under construction.
    Snapshotting,
    /// Snapshot ready to fetch.
    SnapshotReady,
    /// Push persisted.
    Persisted,
    /// Finished without error.
    Completed,
    /// Finished with an error.
    Errored,
}

impl SyncSession {
    /// Creates a freshly started session.
    pub fn new(id: impl Into<String>, parameters: SessionParameters) -> Self {
        let now = SystemTime::now();
        Self {
            id: id.into(),
            created_at: now,
            start_time: now,
            last_connection_time: now,
            started_at_tick: None,
            pull_since: None,
            pull_until: None,
            snapshot_started_at: None,
            snapshot_completed_at: None,
            persist_completed_at: None,
            completed_at: None,
            errors: Vec::new(),
            parameters,
            debug_info: serde_json::Map::new(),
        }
    }

    /// Returns true once the session completed or errored.
    pub fn is_terminal(&self) -> bool {
        self.completed_at.is_some() || self.is_errored()
    }

    /// Returns true if any error was recorded.
    pub fn is_errored(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Returns the most recent error.
    pub fn last_error(&self) -> Option<&str> {
        self.errors.last().map(String::as_str)
    }

    /// Derives the lifecycle phase.
    pub fn phase(&self) -> SessionPhase {
        if self.is_errored() {
            SessionPhase::Errored
        } else if self.completed_at.is_some() {
            SessionPhase::Completed
        } else if self.persist_completed_at.is_some() {
            SessionPhase::Persisted
        } else if self.snapshot_completed_at.is_some() {
            SessionPhase::SnapshotReady
        } else if self.snapshot_started_at.is_some() {
            SessionPhase::Snapshotting
        } else if self.started_at_tick.is_some() {
            SessionPhase::Prepared
        } else {
            SessionPhase::Created
        }
    }

    /// Time elapsed since the row was created.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed().unwrap_or_default()
    }

    /// Time elapsed since the last client operation.
    pub fn idle_for(&self) -> Duration {
        self.last_connection_time.elapsed().unwrap_or_default()
    }
}

/// A device waiting for admission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedDevice {
    /// Device id, the primary key.
    pub device_id: String,
    /// Last time the device asked to sync.
    pub last_seen_time: SystemTime,
    /// Highest tick the device has pulled.
    pub last_synced_tick: i64,
    /// Sticky urgency flag.
    pub urgent: bool,
    /// Facilities the device serves.
    pub facility_ids: Vec<String>,
}
