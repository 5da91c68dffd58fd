//! Inspect command implementation.

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use ticksync_server::{LOOKUP_DEBUG_LOG, LOOKUP_UP_TO_TICK};
use ticksync_store::{CheckpointStats, Database, SessionPhase, StoreOptions, CURRENT_SYNC_TICK};

/// Checkpoint inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Checkpoint path.
    pub path: String,
    /// Current value of the sync clock.
    pub current_tick: Option<i64>,
    /// Cutoff of the last lookup refresh.
    pub lookup_up_to_tick: Option<i64>,
    /// Row counts.
    pub stats: CheckpointStats,
    /// Live records by type.
    pub records_by_type: BTreeMap<String, usize>,
    /// Sessions by lifecycle phase.
    pub sessions_by_phase: BTreeMap<String, usize>,
    /// Devices waiting in the queue.
    pub queued_devices: Vec<String>,
    /// Lookup refresh runs recorded.
    pub lookup_runs: usize,
    /// Every session (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sessions: Option<Vec<SessionSummary>>,
}

/// One session's state.
#[derive(Debug, Serialize)]
pub struct SessionSummary {
    /// Session id.
    pub id: String,
    /// Owning device.
    pub device_id: String,
    /// Lifecycle phase.
    pub phase: SessionPhase,
    /// Pull bounds.
    pub pull_since: Option<i64>,
    /// Pull bounds.
    pub pull_until: Option<i64>,
    /// Most recent error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Runs the inspect command.
pub fn run(path: &Path, show_sessions: bool, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("No checkpoint found at {:?}", path).into());
    }
    let result = inspect(path, show_sessions)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => print_text_output(&result),
    }
    Ok(())
}

fn inspect(path: &Path, show_sessions: bool) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let db = Database::restore(path, StoreOptions::default())?;
    let parse_fact = |key: &str| db.fact(key).and_then(|v| v.parse::<i64>().ok());

    let mut sessions = db.find_sessions(|_| true);
    sessions.sort_by_key(|s| s.created_at);
    let mut sessions_by_phase = BTreeMap::new();
    for session in &sessions {
        *sessions_by_phase
            .entry(format!("{:?}", session.phase()))
            .or_insert(0) += 1;
    }

    Ok(InspectResult {
        path: path.display().to_string(),
        current_tick: parse_fact(CURRENT_SYNC_TICK),
        lookup_up_to_tick: parse_fact(LOOKUP_UP_TO_TICK),
        stats: db.stats(),
        records_by_type: db.record_counts(),
        sessions_by_phase,
        queued_devices: db.queued_devices().into_iter().map(|d| d.device_id).collect(),
        lookup_runs: db.debug_logs(LOOKUP_DEBUG_LOG).len(),
        sessions: show_sessions.then(|| {
            sessions
                .iter()
                .map(|s| SessionSummary {
                    id: s.id.clone(),
                    device_id: s.parameters.device_id.clone(),
                    phase: s.phase(),
                    pull_since: s.pull_since,
                    pull_until: s.pull_until,
                    error: s.last_error().map(str::to_string),
                })
                .collect()
        }),
    })
}

fn print_text_output(result: &InspectResult) {
    let tick = |t: Option<i64>| t.map_or_else(|| "-".to_string(), |t| t.to_string());

    println!("TickSync Checkpoint Inspection");
    println!("==============================");
    println!();
    println!("Path: {}", result.path);
    println!();
    println!("Clock:");
    println!("  Current tick:     {}", tick(result.current_tick));
    println!("  Lookup up to:     {}", tick(result.lookup_up_to_tick));
    println!();
    println!("Rows:");
    println!("  Records:          {}", result.stats.records);
    println!("  Lookup entries:   {}", result.stats.lookup);
    println!("  Snapshot rows:    {}", result.stats.snapshots);
    println!("  Lookup runs:      {}", result.lookup_runs);
    for (record_type, count) in &result.records_by_type {
        println!("    {record_type}: {count}");
    }
    println!();
    println!("Sessions: {}", result.stats.sessions);
    for (phase, count) in &result.sessions_by_phase {
        println!("  {phase}: {count}");
    }
    if !result.queued_devices.is_empty() {
        println!("Queued devices: {}", result.queued_devices.join(", "));
    }

    if let Some(sessions) = &result.sessions {
        println!();
        for s in sessions {
            println!(
                "  [{}] {} {:?} pull ({}, {}]{}",
                s.id,
                s.device_id,
                s.phase,
                tick(s.pull_since),
                tick(s.pull_until),
                s.error
                    .as_ref()
                    .map(|e| format!(" error: {e}"))
                    .unwrap_or_default()
            );
        }
    }
}
