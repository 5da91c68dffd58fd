//! Property-based test generators using proptest.
//!
//! Provides strategies for generating random records, pushes and clinic
//! layouts, plus `rand` helpers for load generation.

use crate::fixtures::TestCenter;
use proptest::prelude::*;
use rand::Rng;
use serde_json::{json, Value};
use ticksync_protocol::{RecordData, SyncChange};

/// Facility ids used by generated clinics.
pub const FACILITIES: [&str; 3] = ["f1", "f2", "f3"];

/// Strategy for generating valid record ids.
pub fn record_id_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9]{0,11}").expect("Invalid regex")
}

/// Strategy for generating a JSON scalar.
pub fn field_value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<i64>().prop_map(Value::from),
        any::<bool>().prop_map(Value::from),
        prop::string::string_regex("[ -~]{0,24}")
            .expect("Invalid regex")
            .prop_map(Value::from),
        Just(Value::Null),
    ]
}

/// Strategy for generating record data with up to eight fields.
pub fn record_data_strategy() -> impl Strategy<Value = RecordData> {
    prop::collection::btree_map(
        prop::string::string_regex("[a-z_]{1,12}").expect("Invalid regex"),
        field_value_strategy(),
        0..8,
    )
    .prop_map(|fields| fields.into_iter().collect())
}

/// Strategy for generating a push of notes: upserts and deletes.
pub fn note_change_strategy() -> impl Strategy<Value = SyncChange> {
    (record_id_strategy(), record_data_strategy(), prop::bool::weighted(0.2)).prop_map(
        |(id, data, delete)| {
            if delete {
                SyncChange::delete("notes", id)
            } else {
                SyncChange::put("notes", id, data)
            }
        },
    )
}

/// Strategy for generating a batch of pushed notes with distinct ids.
pub fn note_batch_strategy(max: usize) -> impl Strategy<Value = Vec<SyncChange>> {
    prop::collection::btree_map(record_id_strategy(), note_change_strategy(), 0..max).prop_map(
        |changes| {
            changes
                .into_iter()
                .map(|(id, mut change)| {
                    change.record_id = id;
                    change
                })
                .collect()
        },
    )
}

/// A randomly shaped clinic.
///
/// Indices refer to patients, encounters or [`FACILITIES`].
#[derive(Debug, Clone)]
pub struct ClinicSpec {
    /// Number of patients.
    pub patients: usize,
    /// Patient-facility markers as (patient, facility).
    pub markers: Vec<(usize, usize)>,
    /// Encounters as (patient, facility).
    pub encounters: Vec<(usize, usize)>,
    /// Lab requests by encounter.
    pub lab_requests: Vec<usize>,
    /// Locations by facility.
    pub locations: Vec<usize>,
    /// Number of global notes.
    pub notes: usize,
}

impl ClinicSpec {
    /// Writes the clinic into `center`.
    pub fn apply(&self, center: &TestCenter) {
        for p in 0..self.patients {
            center.put("patients", &format!("p{p}"), json!({"display_id": format!("P{p}")}));
        }
        for (i, (p, f)) in self.markers.iter().enumerate() {
            center.put(
                "patient_facilities",
                &format!("pf{i}"),
                json!({"patient_id": format!("p{p}"), "facility_id": FACILITIES[*f]}),
            );
        }
        for (i, (p, f)) in self.encounters.iter().enumerate() {
            center.put(
                "encounters",
                &format!("e{i}"),
                json!({"patient_id": format!("p{p}"), "facility_id": FACILITIES[*f]}),
            );
        }
        for (i, e) in self.lab_requests.iter().enumerate() {
            center.put("lab_requests", &format!("lr{i}"), json!({"encounter_id": format!("e{e}")}));
        }
        for (i, f) in self.locations.iter().enumerate() {
            center.put("locations", &format!("l{i}"), json!({"facility_id": FACILITIES[*f]}));
        }
        for n in 0..self.notes {
            center.put("notes", &format!("n{n}"), json!({"n": n}));
        }
    }
}

/// Strategy for generating clinics of up to `max_patients` patients.
pub fn clinic_strategy(max_patients: usize) -> impl Strategy<Value = ClinicSpec> {
    (1..=max_patients.max(1)).prop_flat_map(|patients| {
        let facility = 0..FACILITIES.len();
        let pair = (0..patients, facility.clone());
        (
            prop::collection::vec(pair.clone(), 0..patients * 2),
            prop::collection::vec(pair, 1..patients * 3),
            prop::collection::vec(facility, 0..4),
            0..5usize,
        )
            .prop_flat_map(move |(markers, encounters, locations, notes)| {
                let encounter_count = encounters.len();
                prop::collection::vec(0..encounter_count, 0..encounter_count + 1).prop_map(
                    move |lab_requests| ClinicSpec {
                        patients,
                        markers: markers.clone(),
                        encounters: encounters.clone(),
                        lab_requests,
                        locations: locations.clone(),
                        notes,
                    },
                )
            })
    })
}

/// Generates `count` random note edits for `device`.
///
/// Ids are drawn from a small pool so devices overwrite each other's notes.
pub fn random_note_changes(rng: &mut impl Rng, device: &str, count: usize) -> Vec<SyncChange> {
    (0..count)
        .map(|_| {
            let id = format!("n{}", rng.gen_range(0..64));
            if rng.gen_bool(0.1) {
                SyncChange::delete("notes", id)
            } else {
                let mut data = RecordData::new();
                data.insert("author".into(), json!(device));
                data.insert("value".into(), json!(rng.gen::<u32>()));
                SyncChange::put("notes", id, data)
            }
        })
        .collect()
}
