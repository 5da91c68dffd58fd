//! TickSync CLI
//!
//! Command-line tools for operating and exercising a TickSync center.
//!
//! # Commands
//!
//! - `simulate` - Run an in-process center with devices syncing against it
//! - `config` - Print the effective server configuration
//! - `lookup` - Build the lookup table and print statistics
//! - `inspect` - Display sessions and counters from a checkpoint

mod commands;
mod demo;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// TickSync command-line tools.
#[derive(Parser)]
#[command(name = "ticksync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Server configuration file (JSON); defaults plus TICKSYNC_* variables otherwise
    #[arg(global = true, short, long)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an in-process center with devices doing push/pull rounds
    Simulate {
        /// Number of devices
        #[arg(short, long, default_value = "4")]
        devices: usize,

        /// Sync rounds per device
        #[arg(short, long, default_value = "3")]
        rounds: usize,

        /// Local edits per device per round
        #[arg(long, default_value = "20")]
        changes: usize,

        /// Facilities the devices are spread over
        #[arg(long, default_value = "2")]
        facilities: usize,

        /// Patients seeded at the center
        #[arg(long, default_value = "50")]
        patients: usize,

        /// Build snapshots from the lookup table
        #[arg(long)]
        lookup: bool,

        /// Stream readiness and outgoing changes instead of polling
        #[arg(long)]
        streaming: bool,

        /// Seed for generated edits
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Write a checkpoint of the center here when done
        #[arg(long)]
        checkpoint: Option<PathBuf>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Print the effective server configuration as JSON
    Config,

    /// Build the lookup table and print statistics
    Lookup {
        /// Checkpoint to build over; a demo clinic is seeded otherwise
        #[arg(long)]
        from: Option<PathBuf>,

        /// Patients in the demo clinic
        #[arg(long, default_value = "100")]
        patients: usize,

        /// Write a checkpoint including the built table here
        #[arg(long)]
        output: Option<PathBuf>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Display sessions and counters from a checkpoint
    Inspect {
        /// Checkpoint file
        path: PathBuf,

        /// List every session
        #[arg(short, long)]
        sessions: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Simulate {
            devices,
            rounds,
            changes,
            facilities,
            patients,
            lookup,
            streaming,
            seed,
            checkpoint,
            format,
        } => {
            let config = commands::config::load(cli.config.as_deref())?;
            let options = commands::simulate::SimulateOptions {
                devices,
                rounds,
                changes,
                facilities,
                patients,
                lookup,
                streaming,
                seed,
                checkpoint,
            };
            commands::simulate::run(config, &options, &format)?;
        }
        Commands::Config => {
            commands::config::run(cli.config.as_deref())?;
        }
        Commands::Lookup {
            from,
            patients,
            output,
            format,
        } => {
            let config = commands::config::load(cli.config.as_deref())?;
            commands::lookup::run(config, from.as_deref(), patients, output.as_deref(), &format)?;
        }
        Commands::Inspect {
            path,
            sessions,
            format,
        } => {
            commands::inspect::run(&path, sessions, &format)?;
        }
        Commands::Version => {
            println!("TickSync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
