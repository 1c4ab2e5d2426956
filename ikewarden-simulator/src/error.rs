use thiserror::Error;

use ikewarden_config::ConfigError;
use ikewarden_core::SchedulerError;
use ikewarden_engine::DaemonError;

#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("invalid simulator configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("daemon failure: {0}")]
    Daemon(#[from] DaemonError),

    #[error("link queue full: {0}")]
    Link(#[from] SchedulerError),

    #[error("loss probability {0} outside 0.0..=1.0")]
    InvalidLossProbability(f64),

    #[error("trace hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },
}
