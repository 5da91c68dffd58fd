//! Benchmark utilities.

#![warn(missing_docs)]

use rand::Rng;
use serde_json::json;
use std::time::Duration;
use ticksync_protocol::{PageRequest, PullRequest, RecordData, SyncDirection, SyncRequest};
use ticksync_server::{ModelRegistry, SimpleModel, SyncConfig, SyncManager};
use ticksync_store::{Database, Record};

/// Facilities records are spread over.
pub const FACILITIES: usize = 4;

/// Generate random record data with `fields` string fields.
pub fn random_data(fields: usize) -> RecordData {
    let mut rng = rand::thread_rng();
    (0..fields)
        .map(|i| (format!("field_{i}"), json!(rng.gen::<u64>().to_string())))
        .collect()
}

/// Models used by the benchmarks: facility-scoped encounters, global
/// reference data.
pub fn models() -> ModelRegistry {
    ModelRegistry::new()
        .register(
            SimpleModel::new("encounters", SyncDirection::Bidirectional)
                .with_facility_field("facility_id"),
        )
        .register(SimpleModel::new("reference_data", SyncDirection::PullFromCentral))
}

/// Writes `count` encounters spread over [`FACILITIES`] and `count / 10`
/// reference rows, in batches of 500.
pub fn seed(db: &Database, count: usize) {
    let ids: Vec<usize> = (0..count).collect();
    for batch in ids.chunks(500) {
        db.transaction(|txn| {
            for i in batch {
                let mut data = random_data(4);
                data.insert("facility_id".into(), json!(format!("f{}", i % FACILITIES)));
                txn.put_record(Record::new("encounters", format!("e{i:08}"), data))?;
                if i % 10 == 0 {
                    txn.put_record(Record::new("reference_data", format!("r{i:08}"), random_data(2)))?;
                }
            }
            Ok(())
        })
        .unwrap();
    }
}

/// Creates a manager over a seeded database.
pub fn seeded_manager(count: usize, lookup: bool) -> SyncManager {
    let db = Database::new();
    seed(&db, count);
    let config = SyncConfig::new()
        .with_await_preparation(true)
        .with_lookup_table(lookup);
    SyncManager::new(db, config, models()).unwrap()
}

/// Runs one full initial pull for facility `f0` and returns the number of
/// records received.
pub async fn full_pull(manager: &SyncManager, device: &str) -> usize {
    let status = manager
        .check_sync_request(SyncRequest::new(device, 0, vec!["f0".into()]))
        .await
        .unwrap();
    let session_id = status.session_id().unwrap().to_string();
    manager
        .initiate_pull(&session_id, PullRequest::new(-1, vec!["f0".into()]))
        .unwrap();
    while !manager.check_pull_ready(&session_id).unwrap() {
        tokio::time::sleep(Duration::from_micros(200)).await;
    }

    let mut received = 0;
    let mut from_id = None;
    loop {
        let page = manager
            .get_outgoing_changes(&session_id, PageRequest::new(from_id, 1_000))
            .unwrap();
        let Some(next) = page.next_from_id() else {
            break;
        };
        received += page.records.len();
        from_id = Some(next);
    }
    manager.end_session(&session_id, Default::default()).unwrap();
    received
}
