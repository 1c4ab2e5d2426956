//! Simulator configuration.
//!
//! Parameters for the deterministic two-peer DPD simulation: run length,
//! seed, and the impairments of the simulated link.
use std::path::Path;
use std::path::PathBuf;

use figment::providers::Format;
use figment::providers::Yaml;
use figment::Figment;
use serde::{Deserialize, Serialize};
use validator::{self, Validate};

use crate::{ConfigError, ConnectionsConfig};

#[derive(Debug, Serialize, Deserialize, Validate, Clone, PartialEq)]
pub struct SimulatorConfig {
    /// Seed for deterministic simulation.
    pub seed: u64,
    /// Simulated run length in seconds.
    #[validate(range(min = 1, max = 31536000))]
    pub duration_secs: u64,
    /// SA lifetime negotiated for the simulated phase-1 SA (0 = no expiry).
    #[serde(default)]
    pub sa_lifetime_secs: u64,
    /// Network emulation parameters.
    #[serde(default)]
    #[validate(nested)]
    pub network: NetworkModelConfig,
    /// Always-up connections each simulated peer registers at startup.
    #[serde(default)]
    #[validate(nested)]
    pub connections: ConnectionsConfig,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            duration_secs: 3600,
            sa_lifetime_secs: 0,
            network: NetworkModelConfig::default(),
            connections: ConnectionsConfig::default(),
        }
    }
}

impl SimulatorConfig {
    /// Load only SimulatorConfig from a specific path.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(PathBuf::from(
                path.to_string_lossy().to_string(),
            )));
        }

        Figment::new()
            .merge(Yaml::file(path))
            .extract()
            .map_err(ConfigError::from)
            .and_then(|config: Self| {
                config.validate()?;
                Ok(config)
            })
    }
}

#[derive(Default, Debug, Serialize, Deserialize, Validate, Clone, PartialEq)]
pub struct NetworkModelConfig {
    /// Fixed one-way latency in milliseconds.
    #[serde(default)]
    #[validate(range(max = 60000))]
    pub latency_ms: u64,
    /// Maximum additional jitter in milliseconds.
    #[serde(default)]
    #[validate(range(max = 60000))]
    pub jitter_ms: u64,
    /// Probability (0.0 to 1.0) that a datagram is lost.
    #[serde(default)]
    #[validate(range(min = 0.0, max = 1.0))]
    pub loss_probability: f64,
}
