//! Replay module.
//!
//! A run is fully determined by its configuration, so replaying means running
//! the same configuration again and comparing trace hashes.

use tracing::{error, info};

use ikewarden_config::SimulatorConfig;
use ikewarden_telemetry::MetricsRecorder;

use crate::{simulate, SimulationError, SimulationReport};

/// Re-runs `config` and checks the trace hash against `expected`.
pub fn replay_scenario(
    config: SimulatorConfig,
    expected: &str,
) -> Result<SimulationReport, SimulationError> {
    let seed = config.seed;
    let report = simulate(config, MetricsRecorder::new())?;
    if !report.trace_hash.eq_ignore_ascii_case(expected.trim()) {
        error!("replay: seed {seed} diverged, expected {expected}");
        return Err(SimulationError::HashMismatch {
            expected: expected.to_owned(),
            actual: report.trace_hash,
        });
    }
    info!("replay: seed {seed} reproduced {}", report.trace_hash);
    Ok(report)
}
