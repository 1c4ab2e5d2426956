use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use opentelemetry::KeyValue;
use tracing::{info, instrument};

use ikewarden_config::{ConnectionsConfig, IkewardenConfig, NetworkModelConfig, SimulatorConfig};
use ikewarden_simulator::replay::replay_scenario;
use ikewarden_simulator::{simulate, SimulationReport};
use ikewarden_telemetry::logging::EventLogger;
use ikewarden_telemetry::metrics::MetricsRecorder;

use crate::error::CliError;

#[derive(Parser)]
#[command(name = "ikewarden", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a deterministic two-peer DPD simulation
    Simulate(SimulateArgs),
    /// Print the effective configuration after validation
    Config(ConfigArgs),
}

#[derive(Args, Debug, Clone)]
pub struct SimulateArgs {
    /// Simulator configuration file; replaces the link flags below
    #[arg(short, long)]
    pub scenario: Option<PathBuf>,
    #[arg(long, default_value_t = 42)]
    pub seed: u64,
    /// Simulated run length in seconds
    #[arg(long, default_value_t = 3600)]
    pub duration: u64,
    /// Probability that a datagram is lost
    #[arg(long, default_value_t = 0.0)]
    pub loss: f64,
    #[arg(long, default_value_t = 50)]
    pub latency_ms: u64,
    #[arg(long, default_value_t = 0)]
    pub jitter_ms: u64,
    /// Lifetime of the simulated SA in seconds (0 = never expires)
    #[arg(long, default_value_t = 0)]
    pub sa_lifetime: u64,
    /// Always-up phase-2 connection both peers register (repeatable)
    #[arg(long = "connection")]
    pub connections: Vec<String>,
    /// Fail unless the run reproduces this trace hash
    #[arg(long)]
    pub validate_hash: Option<String>,
    /// Dump prometheus metrics after the run
    #[arg(long, default_value_t = false)]
    pub metrics: bool,
}

impl SimulateArgs {
    fn simulator_config(&self) -> Result<SimulatorConfig, CliError> {
        if let Some(path) = &self.scenario {
            return Ok(SimulatorConfig::load_from_path(path)?);
        }
        Ok(SimulatorConfig {
            seed: self.seed,
            duration_secs: self.duration,
            sa_lifetime_secs: self.sa_lifetime,
            network: NetworkModelConfig {
                latency_ms: self.latency_ms,
                jitter_ms: self.jitter_ms,
                loss_probability: self.loss,
            },
            connections: ConnectionsConfig {
                phase2: self.connections.clone(),
            },
        })
    }
}

#[derive(Args, Debug, Clone)]
pub struct ConfigArgs {
    /// Load this file instead of the default search path
    #[arg(short, long)]
    pub path: Option<PathBuf>,
}

#[instrument(level = "info", name = "run_simulation", skip(args, metrics))]
pub fn run_simulation(args: SimulateArgs, metrics: &MetricsRecorder) -> Result<(), CliError> {
    let config = args.simulator_config()?;
    let seed = config.seed;
    let report: SimulationReport = match &args.validate_hash {
        Some(expected) => replay_scenario(config, expected)?,
        None => simulate(config, metrics.clone())?,
    };

    info!(
        "Simulation complete: {} sent, {} dropped, {} delivered, {} dead peers",
        report.stats.sent, report.stats.dropped, report.stats.delivered, report.stats.dead_peers
    );
    EventLogger::log_event(
        "simulation_complete",
        vec![
            KeyValue::new("seed", seed.to_string()),
            KeyValue::new("final_hash", report.trace_hash.clone()),
        ],
    );
    println!("{}", report.trace_hash);
    if args.metrics {
        print!("{}", metrics.gather_metrics()?);
    }
    Ok(())
}

pub fn show_config(args: ConfigArgs) -> Result<(), CliError> {
    let config = match &args.path {
        Some(path) => IkewardenConfig::load_from_path(path)?,
        None => IkewardenConfig::load()?,
    };
    print!("{}", render_config(&config)?);
    Ok(())
}

fn render_config(config: &IkewardenConfig) -> Result<String, CliError> {
    Ok(serde_yaml::to_string(config)?)
}
