//! The demo model set and clinic used by the simulation and lookup
//! commands.

use serde_json::{json, Value};
use ticksync_protocol::{RecordData, SyncDirection};
use ticksync_server::{ModelRegistry, SimpleModel};
use ticksync_store::{Database, Record, StoreResult};

/// Models of a small clinical deployment.
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
}

/// Facility id of the `index`th facility.
pub fn facility(index: usize) -> String {
    format!("facility-{index}")
}

pub fn data(value: Value) -> RecordData {
    match value {
        Value::Object(map) => map,
        _ => RecordData::new(),
    }
}

/// Seeds `patients` patients spread round-robin over `facilities`
/// facilities, each with a marker, an encounter and every third with a
/// lab request, plus per-facility locations and shared reference data.
pub fn seed_clinic(db: &Database, patients: usize, facilities: usize) -> StoreResult<()> {
    let facilities = facilities.max(1);
    db.transaction(|txn| {
        for f in 0..facilities {
            txn.put_record(Record::new(
                "locations",
                format!("loc-{f}"),
                data(json!({"facility_id": facility(f), "name": format!("Ward {f}")})),
            ))?;
        }
        for r in 0..10 {
            txn.put_record(Record::new(
                "reference_data",
                format!("ref-{r}"),
                data(json!({"code": format!("ICD-{r:03}")})),
            ))?;
        }
        Ok(())
    })?;

    for p in 0..patients {
        let facility_id = facility(p % facilities);
        db.transaction(|txn| {
            let patient_id = format!("patient-{p}");
            txn.put_record(Record::new(
                "patients",
                patient_id.clone(),
                data(json!({"display_id": format!("P{p:05}")})),
            ))?;
            txn.put_record(Record::new(
                "patient_facilities",
                format!("pf-{p}"),
                data(json!({"patient_id": patient_id, "facility_id": facility_id})),
            ))?;
            txn.put_record(Record::new(
                "encounters",
                format!("enc-{p}"),
                data(json!({"patient_id": patient_id, "facility_id": facility_id})),
            ))?;
            if p % 3 == 0 {
                txn.put_record(Record::new(
                    "lab_requests",
                    format!("lab-{p}"),
                    data(json!({"encounter_id": format!("enc-{p}")})),
                ))?;
            }
            Ok(())
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clinic_is_spread_over_facilities() {
        let db = Database::new();
        seed_clinic(&db, 7, 3).unwrap();
        let counts = db.record_counts();
        assert_eq!(counts["patients"], 7);
        assert_eq!(counts["lab_requests"], 3);
        assert_eq!(counts["locations"], 3);
        let marker = db.begin().get_record("patient_facilities", "pf-4").unwrap();
        assert_eq!(marker.field_str("facility_id"), Some("facility-1"));
    }
}
