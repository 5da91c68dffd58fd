//! Stress tests for TickSync.
//!
//! These helpers verify behavior under concurrent devices and heavy clock
//! use.

use crate::fixtures::TestCenter;
use crate::generators::random_note_changes;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use ticksync_server::SyncClock;

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            duration,
            ops_per_second,
        }
    }

    /// Prints a summary of the test.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Total operations: {}", self.total_ops);
        println!("Successful: {}", self.successful_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of concurrent devices.
    pub devices: usize,
    /// Syncs each device runs.
    pub syncs_per_device: usize,
    /// Local edits made before each sync.
    pub changes_per_sync: usize,
    /// Threads for clock tests.
    pub threads: usize,
    /// Clock advances per thread.
    pub ticks_per_thread: usize,
    /// Seed for generated edits.
    pub seed: u64,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            devices: 8,
            syncs_per_device: 5,
            changes_per_sync: 20,
            threads: 4,
            ticks_per_thread: 1_000,
            seed: 42,
        }
    }
}

/// Advances the clock from many threads at once.
///
/// An operation fails when its tick was already handed out.
pub fn stress_tick_tock(clock: &SyncClock, config: &StressConfig) -> StressTestResult {
    let start = Instant::now();
    let handles: Vec<_> = (0..config.threads)
        .map(|_| {
            let clock = clock.clone();
            let ticks = config.ticks_per_thread;
            thread::spawn(move || {
                (0..ticks)
                    .filter_map(|_| clock.tick_tock().ok())
                    .map(|t| t.tock)
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut seen = HashSet::new();
    let mut successful = 0usize;
    let mut failed = 0usize;
    for handle in handles {
        for tock in handle.join().expect("clock thread panicked") {
            if seen.insert(tock) {
                successful += 1;
            } else {
                failed += 1;
            }
        }
    }
    failed += config.threads * config.ticks_per_thread - successful - failed;

    StressTestResult::new(successful, failed, start.elapsed())
}

/// Runs every device's syncs concurrently against `center`.
///
/// Each sync pushes fresh random edits; an operation is one sync.
pub async fn stress_concurrent_devices(
    center: Arc<TestCenter>,
    config: &StressConfig,
) -> StressTestResult {
    let start = Instant::now();
    let tasks: Vec<_> = (0..config.devices)
        .map(|d| {
            let center = Arc::clone(&center);
            let config = config.clone();
            tokio::spawn(async move {
                let device = format!("device-{d}");
                let client = center.client(&device, &["f1"]);
                let mut rng = StdRng::seed_from_u64(config.seed + d as u64);
                let mut successful = 0usize;
                let mut failed = 0usize;
                for _ in 0..config.syncs_per_device {
                    for change in random_note_changes(&mut rng, &device, config.changes_per_sync) {
                        client.store().write(change);
                    }
                    match client.sync().await {
                        Ok(_) => successful += 1,
                        Err(e) => {
                            tracing::warn!(device = %device, error = %e, "stress sync failed");
                            failed += 1;
                        }
                    }
                }
                (successful, failed)
            })
        })
        .collect();

    let mut successful = 0usize;
    let mut failed = 0usize;
    for task in tasks {
        let (ok, err) = task.await.expect("device task panicked");
        successful += ok;
        failed += err;
    }

    StressTestResult::new(successful, failed, start.elapsed())
}
