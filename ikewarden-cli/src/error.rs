use thiserror::Error;

use ikewarden_config::ConfigError;
use ikewarden_simulator::SimulationError;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Simulation(#[from] SimulationError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("cannot render configuration: {0}")]
    Render(#[from] serde_yaml::Error),

    #[error("cannot gather metrics: {0}")]
    Metrics(#[from] prometheus::Error),
}
