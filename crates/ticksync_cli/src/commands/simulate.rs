//! Simulate command implementation.
//!
//! Runs a center in-process and drives devices through it over the
//! loopback transport. Each round a device records notes and encounters
//! for its facility's patients, then syncs. A final quiet round lets every
//! device catch up, after which all devices must agree with the center on
//! the shared notes.

use crate::demo;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use ticksync_client::{
    ClientConfig, LoopbackTransport, MemoryClientStore, RetryConfig, SyncClient,
};
use ticksync_protocol::SyncChange;
use ticksync_server::{SyncConfig, SyncServer};
use ticksync_store::Database;
use tracing::{info, warn};

type Device = SyncClient<LoopbackTransport, MemoryClientStore>;

/// Simulation parameters.
#[derive(Debug, Clone)]
pub struct SimulateOptions {
    /// Number of devices.
    pub devices: usize,
    /// Sync rounds per device.
    pub rounds: usize,
    /// Local edits per device per round.
    pub changes: usize,
    /// Facilities the devices are spread over.
    pub facilities: usize,
    /// Patients seeded at the center.
    pub patients: usize,
    /// Build snapshots from the lookup table.
    pub lookup: bool,
    /// Stream instead of polling.
    pub streaming: bool,
    /// Seed for generated edits.
    pub seed: u64,
    /// Checkpoint destination.
    pub checkpoint: Option<PathBuf>,
}

/// Simulation summary.
#[derive(Debug, Default, Serialize)]
pub struct SimulateSummary {
    /// Devices simulated.
    pub devices: usize,
    /// Sessions that completed.
    pub sessions_completed: u64,
    /// Sessions that failed.
    pub sessions_failed: u64,
    /// Changes the center persisted.
    pub changes_pushed: u64,
    /// Records devices pulled.
    pub records_pulled: u64,
    /// Clock value at the end.
    pub final_tick: i64,
    /// Whether every device agrees with the center on shared notes.
    pub converged: bool,
    /// Wall time.
    pub duration_ms: u64,
    /// Completed sessions per second.
    pub sessions_per_second: f64,
}

/// Runs the simulate command.
pub fn run(
    config: SyncConfig,
    options: &SimulateOptions,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let summary = runtime.block_on(simulate(config, options))?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&summary)?),
        _ => print_text_output(&summary),
    }
    Ok(())
}

/// Runs the simulation and returns its summary.
pub async fn simulate(
    config: SyncConfig,
    options: &SimulateOptions,
) -> Result<SimulateSummary, Box<dyn std::error::Error>> {
    let facilities = options.facilities.max(1);
    let db = Database::new();
    demo::seed_clinic(&db, options.patients, facilities)?;

    let config = config
        .with_lookup_table(options.lookup)
        .with_lookup_refresh_interval(Some(Duration::from_millis(50)));
    let server = Arc::new(SyncServer::new(db, config, demo::models())?);
    if options.lookup {
        server.manager().lookup().run().await?;
    }
    server.start();

    let started = Instant::now();
    let devices: Vec<Arc<Device>> = (0..options.devices)
        .map(|d| Arc::new(device(&server, d, facilities, options.streaming)))
        .collect();

    let tasks: Vec<_> = devices
        .iter()
        .enumerate()
        .map(|(d, device)| {
            let device = Arc::clone(device);
            let options = options.clone();
            tokio::spawn(async move {
                let mut rng = StdRng::seed_from_u64(options.seed.wrapping_add(d as u64));
                for round in 0..options.rounds {
                    for change in edits(&mut rng, &device, d, facilities, &options) {
                        device.store().write(change);
                    }
                    if let Err(e) = device.sync().await {
                        warn!(device = %device.config().device_id, round, error = %e, "simulated sync failed");
                    }
                }
            })
        })
        .collect();
    for task in tasks {
        task.await?;
    }

    // Quiet round: nothing left to push, everything left to pull.
    if options.lookup {
        // A scheduled refresh may hold the lock with an earlier cutoff.
        while server.manager().lookup().run().await?.is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
    for device in &devices {
        if let Err(e) = device.sync().await {
            warn!(device = %device.config().device_id, error = %e, "final sync failed");
        }
    }
    let duration = started.elapsed();

    let central_notes = {
        let txn = server.manager().db().begin();
        txn.scan_records("notes", None, usize::MAX, |r| !r.is_deleted)
            .into_iter()
            .map(|r| r.id)
            .collect::<Vec<_>>()
    };
    let converged = devices
        .iter()
        .all(|device| device.store().ids("notes") == central_notes);

    let mut summary = SimulateSummary {
        devices: devices.len(),
        final_tick: server.manager().clock().current()?,
        converged,
        duration_ms: duration.as_millis() as u64,
        ..Default::default()
    };
    for device in &devices {
        let stats = device.stats();
        summary.sessions_completed += stats.sessions_completed;
        summary.sessions_failed += stats.sessions_failed;
        summary.changes_pushed += stats.changes_pushed;
        summary.records_pulled += stats.records_pulled;
    }
    if duration.as_secs_f64() > 0.0 {
        summary.sessions_per_second = summary.sessions_completed as f64 / duration.as_secs_f64();
    }

    server.shutdown().await;
    if let Some(path) = &options.checkpoint {
        server.manager().db().checkpoint(path)?;
    }
    info!(
        sessions = summary.sessions_completed,
        failed = summary.sessions_failed,
        converged,
        duration_ms = summary.duration_ms,
        "simulation finished"
    );
    Ok(summary)
}

fn device(server: &SyncServer, index: usize, facilities: usize, streaming: bool) -> Device {
    let config = ClientConfig::new(format!("device-{index}"))
        .with_facilities(vec![demo::facility(index % facilities)])
        .with_streaming(streaming)
        .with_admission(
            RetryConfig::new(u32::MAX)
                .with_initial_delay(Duration::from_millis(5))
                .with_max_delay(Duration::from_millis(100)),
        )
        .with_polling(RetryConfig::fixed(u32::MAX, Duration::from_millis(5)));
    SyncClient::new(config, LoopbackTransport::from_server(server), MemoryClientStore::new())
}

/// Local edits for one round: shared notes plus encounters for patients
/// of the device's facility.
fn edits(
    rng: &mut StdRng,
    device: &Device,
    index: usize,
    facilities: usize,
    options: &SimulateOptions,
) -> Vec<SyncChange> {
    let device_id = &device.config().device_id;
    let facility = index % facilities;
    (0..options.changes)
        .map(|i| {
            if options.patients > facility && rng.gen_bool(0.3) {
                // Patients are seeded round-robin over facilities.
                let slots = (options.patients - facility).div_ceil(facilities);
                let patient = facility + facilities * rng.gen_range(0..slots);
                SyncChange::put(
                    "encounters",
                    format!("{device_id}-enc-{}", rng.gen::<u32>()),
                    demo::data(json!({
                        "patient_id": format!("patient-{patient}"),
                        "facility_id": demo::facility(facility),
                    })),
                )
            } else if rng.gen_bool(0.1) {
                SyncChange::delete("notes", format!("note-{}", rng.gen_range(0..32)))
            } else {
                SyncChange::put(
                    "notes",
                    format!("note-{}", rng.gen_range(0..32)),
                    demo::data(json!({"author": device_id, "edit": i})),
                )
            }
        })
        .collect()
}

fn print_text_output(summary: &SimulateSummary) {
    println!("TickSync Simulation");
    println!("===================");
    println!();
    println!("Devices:            {}", summary.devices);
    println!("Sessions completed: {}", summary.sessions_completed);
    println!("Sessions failed:    {}", summary.sessions_failed);
    println!("Changes pushed:     {}", summary.changes_pushed);
    println!("Records pulled:     {}", summary.records_pulled);
    println!("Final tick:         {}", summary.final_tick);
    println!("Converged:          {}", if summary.converged { "yes" } else { "NO" });
    println!("Duration:           {} ms", summary.duration_ms);
    println!("Throughput:         {:.2} sessions/sec", summary.sessions_per_second);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> SimulateOptions {
        SimulateOptions {
            devices: 3,
            rounds: 2,
            changes: 8,
            facilities: 2,
            patients: 10,
            lookup: false,
            streaming: false,
            seed: 1,
            checkpoint: None,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn devices_converge_on_tables() {
        let summary = simulate(SyncConfig::new(), &options()).await.unwrap();
        assert_eq!(summary.sessions_failed, 0);
        assert_eq!(summary.sessions_completed, 9);
        assert!(summary.converged);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn devices_converge_on_the_lookup_table_with_streaming() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sim.json");
        let options = SimulateOptions {
            lookup: true,
            streaming: true,
            checkpoint: Some(path.clone()),
            ..options()
        };
        let summary = simulate(SyncConfig::new(), &options).await.unwrap();
        assert_eq!(summary.sessions_failed, 0);
        assert!(summary.converged);
        assert!(path.exists());
    }
}
