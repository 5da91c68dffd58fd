//! Change records exchanged between clients and the center.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Serialized column data of a single record.
pub type RecordData = serde_json::Map<String, Value>;

/// Key holding the per-field update ticks inside record data.
const UPDATED_AT_BY_FIELD: &str = "updated_at_by_field";

/// A change pushed by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncChange {
    /// Model name of the record.
    pub record_type: String,
    /// Primary key of the record.
    pub record_id: String,
    /// Whether the record is a tombstone.
    #[serde(default)]
    pub is_deleted: bool,
    /// Full column data.
    #[serde(default)]
    pub data: RecordData,
}

impl SyncChange {
    /// Creates a change for a live record.
    pub fn put(record_type: impl Into<String>, record_id: impl Into<String>, data: RecordData) -> Self {
        Self {
            record_type: record_type.into(),
            record_id: record_id.into(),
            is_deleted: false,
            data,
        }
    }

    /// Creates a tombstone change.
    pub fn delete(record_type: impl Into<String>, record_id: impl Into<String>) -> Self {
        Self {
            record_type: record_type.into(),
            record_id: record_id.into(),
            is_deleted: true,
            data: RecordData::new(),
        }
    }

    /// Returns the checksum over the change's per-field update ticks.
    pub fn updated_at_by_field_sum(&self) -> Option<i64> {
        updated_at_by_field_sum(&self.data)
    }
}

/// A change delivered to a client during pull.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRecord {
    /// Snapshot row id, used as the paging cursor.
    pub id: u64,
    /// Model name of the record.
    pub record_type: String,
    /// Primary key of the record.
    pub record_id: String,
    /// Whether the record is a tombstone.
    pub is_deleted: bool,
    /// Full column data.
    pub data: RecordData,
    /// Tick the record was captured at.
    pub saved_at_sync_tick: i64,
    /// Audit entries for the record inside the session's source window.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changelog_records: Vec<ChangelogRecord>,
}

/// An audit entry attached to an outgoing record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangelogRecord {
    /// Sequential id of the entry.
    pub id: u64,
    /// Model name of the audited record.
    pub record_type: String,
    /// Primary key of the audited record.
    pub record_id: String,
    /// Tick the audited write was stamped with.
    pub logged_at_sync_tick: i64,
    /// Record data after the write.
    pub record_data: RecordData,
}

/// Computes the checksum over a record's per-field update ticks.
///
/// Returns `None` when the record carries no per-field map. The value is
/// an opaque wrapping sum, only meaningful for equality comparison.
pub fn updated_at_by_field_sum(data: &RecordData) -> Option<i64> {
    let fields = data.get(UPDATED_AT_BY_FIELD)?.as_object()?;
    Some(
        fields
            .values()
            .filter_map(Value::as_i64)
            .fold(0i64, |acc, tick| acc.wrapping_add(tick)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data(value: Value) -> RecordData {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn checksum_sums_field_ticks() {
        let record = data(json!({
            "name": "Ana",
            "updated_at_by_field": { "name": 12, "dob": 30 }
        }));
        assert_eq!(updated_at_by_field_sum(&record), Some(42));
    }

    #[test]
    fn checksum_absent_without_field_map() {
        let record = data(json!({ "name": "Ana" }));
        assert_eq!(updated_at_by_field_sum(&record), None);
    }

    #[test]
    fn checksum_wraps_instead_of_overflowing() {
        let record = data(json!({
            "updated_at_by_field": { "a": i64::MAX, "b": 1 }
        }));
        assert_eq!(updated_at_by_field_sum(&record), Some(i64::MIN));
    }

    #[test]
    fn change_uses_camel_case_on_the_wire() {
        let change = SyncChange::delete("patients", "p1");
        let json = serde_json::to_value(&change).unwrap();
        assert_eq!(json["recordType"], "patients");
        assert_eq!(json["isDeleted"], true);
    }

    #[test]
    fn record_omits_empty_changelog() {
        let record = SyncRecord {
            id: 1,
            record_type: "patients".into(),
            record_id: "p1".into(),
            is_deleted: false,
            data: RecordData::new(),
            saved_at_sync_tick: 5,
            changelog_records: vec![],
        };
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("changelogRecords").is_none());
    }
}
