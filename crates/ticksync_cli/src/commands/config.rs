//! Config command implementation.

use std::path::Path;
use ticksync_server::SyncConfig;

/// Loads the server configuration from `path`, or from the defaults with
/// `TICKSYNC_*` environment overrides.
pub fn load(path: Option<&Path>) -> Result<SyncConfig, Box<dyn std::error::Error>> {
    let config = match path {
        Some(path) => SyncConfig::from_json_file(path)?,
        None => SyncConfig::from_env()?,
    };
    Ok(config)
}

/// Runs the config command.
pub fn run(path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let config = load(path)?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
