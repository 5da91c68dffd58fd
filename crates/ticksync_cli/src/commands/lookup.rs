//! Lookup command implementation.

use crate::demo;
use serde::Serialize;
use std::path::Path;
use std::time::Instant;
use ticksync_server::{SyncConfig, SyncManager};
use ticksync_store::{Database, StoreOptions};

/// Lookup build result.
#[derive(Debug, Serialize)]
pub struct LookupResult {
    /// Where the records came from.
    pub source: String,
    /// Live records scanned.
    pub records: usize,
    /// Cutoff of the previous build, or -1.
    pub since: i64,
    /// Cutoff of this build.
    pub cutoff: i64,
    /// Entries written by this build.
    pub updated: usize,
    /// Entries in the table afterwards.
    pub entries: usize,
    /// Whether the table was built from scratch.
    pub initial_build: bool,
    /// Wall time of the build.
    pub duration_ms: u64,
}

/// Runs the lookup command.
pub fn run(
    config: SyncConfig,
    from: Option<&Path>,
    patients: usize,
    output: Option<&Path>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let (db, source) = match from {
        Some(path) => (
            Database::restore(path, StoreOptions::default())?,
            path.display().to_string(),
        ),
        None => {
            let db = Database::new();
            demo::seed_clinic(&db, patients, 2)?;
            (db, format!("demo clinic ({patients} patients)"))
        }
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let manager = SyncManager::new(db, config.with_lookup_table(true), demo::models())?;
    let started = Instant::now();
    let refresh = runtime
        .block_on(manager.lookup().run())?
        .ok_or("another lookup refresh holds the lock")?;

    let stats = manager.db().stats();
    let result = LookupResult {
        source,
        records: stats.records,
        since: refresh.since,
        cutoff: refresh.cutoff,
        updated: refresh.updated,
        entries: stats.lookup,
        initial_build: refresh.initial_build,
        duration_ms: started.elapsed().as_millis() as u64,
    };

    if let Some(output) = output {
        manager.db().checkpoint(output)?;
    }

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => print_text_output(&result),
    }
    Ok(())
}

fn print_text_output(result: &LookupResult) {
    println!("TickSync Lookup Build");
    println!("=====================");
    println!();
    println!("Source:   {}", result.source);
    println!("Records:  {}", result.records);
    println!();
    if result.initial_build {
        println!("Initial build up to tick {}", result.cutoff);
    } else {
        println!("Refresh from tick {} to {}", result.since, result.cutoff);
    }
    println!("  Updated: {}", result.updated);
    println!("  Entries: {}", result.entries);
    println!("  Took:    {} ms", result.duration_ms);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_over_a_checkpoint_and_refreshes_incrementally() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first.json");
        let second = dir.path().join("second.json");

        run(SyncConfig::new(), None, 9, Some(&first), "json").unwrap();
        let db = Database::restore(&first, StoreOptions::default()).unwrap();
        let built = db.stats().lookup;
        assert_eq!(built, db.stats().records);

        run(SyncConfig::new(), Some(&first), 0, Some(&second), "text").unwrap();
        let db = Database::restore(&second, StoreOptions::default()).unwrap();
        assert_eq!(db.stats().lookup, built);
    }
}
