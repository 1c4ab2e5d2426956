//! ## ikewarden-cli
//! **Operational interface for the liveness core**
//!
//! - `ikewarden simulate`: deterministic two-peer DPD run, optionally checked
//!   against a recorded trace hash
//! - `ikewarden config`: load, validate and print the effective configuration

use clap::Parser;
use ikewarden_config::IkewardenConfig;
use ikewarden_telemetry::logging::EventLogger;
use ikewarden_telemetry::metrics::MetricsRecorder;

mod commands;
mod error;

use commands::{Cli, Commands};

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();
    let level = IkewardenConfig::load()
        .map(|config| config.telemetry.log_level)
        .unwrap_or_else(|_| "info".into());
    EventLogger::init(&level);
    let metrics = MetricsRecorder::new();

    match cli.command {
        Commands::Simulate(args) => commands::run_simulation(args, &metrics)?,
        Commands::Config(args) => commands::show_config(args)?,
    }
    Ok(())
}
