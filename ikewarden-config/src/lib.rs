//! # ikewarden Configuration System
//!
//! Hierarchical configuration for the key-management daemon.
//!
//! ## Features
//! - **Unified Configuration**: one validated struct for every component
//! - **Point-of-use lookups**: [`ConfigLookup::get_num`] over the effective figment
//! - **Environment Awareness**: per-environment YAML overlays and `IKEWARDEN_*` variables

#![warn(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use validator::Validate;

mod connections;
mod error;
mod general;
mod lookup;
mod simulator;
mod telemetry;
mod validation;

pub use connections::ConnectionsConfig;
pub use error::ConfigError;
pub use general::*;
pub use lookup::{ConfigLookup, Settings};
pub use simulator::{NetworkModelConfig, SimulatorConfig};
pub use telemetry::TelemetryConfig;

/// Top‑level configuration container.
#[derive(Debug, Serialize, Deserialize, Validate, Default, Clone, PartialEq)]
pub struct IkewardenConfig {
    /// Timing and capacity parameters of the scheduling core.
    #[serde(default)]
    #[validate(nested)]
    pub general: GeneralConfig,

    /// Connections kept established by the supervisor.
    #[serde(default)]
    #[validate(nested)]
    pub connections: ConnectionsConfig,

    /// Logging and observability.
    #[serde(default)]
    #[validate(nested)]
    pub telemetry: TelemetryConfig,
}

impl IkewardenConfig {
    /// Load configuration from default files and environment.
    ///
    /// Hierarchy:
    /// 1. Default Values
    /// 2. `config/ikewarden.yaml` - Base settings. If missing, defaults are used.
    /// 3. `config/<environment>.yaml` - Environment‑specific overrides.
    /// 4. `IKEWARDEN_*` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(IkewardenConfig::default()));

        if Path::new("config/ikewarden.yaml").exists() {
            figment = figment.merge(Yaml::file("config/ikewarden.yaml"));
        } else {
            info!("config/ikewarden.yaml not found, using default configuration");
        }

        let env = std::env::var("IKEWARDEN_ENV").unwrap_or_else(|_| "production".into());
        let env_file = format!("config/{}.yaml", env);
        if Path::new(&env_file).exists() {
            debug!("Merging {env_file}");
            figment = figment.merge(Yaml::file(env_file));
        }

        Self::extract_validated(figment.merge(Env::prefixed("IKEWARDEN_").split("__")))
    }

    /// Load configuration from a specific path, on top of the defaults.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(PathBuf::from(
                path.to_string_lossy().to_string(),
            )));
        }

        Self::extract_validated(
            Figment::from(Serialized::defaults(IkewardenConfig::default()))
                .merge(Yaml::file(path))
                .merge(Env::prefixed("IKEWARDEN_").split("__")),
        )
    }

    fn extract_validated(figment: Figment) -> Result<Self, ConfigError> {
        figment
            .extract()
            .map_err(ConfigError::from)
            .and_then(|config: Self| {
                config.validate()?;
                Ok(config)
            })
    }

    /// Numeric lookups over this configuration.
    pub fn settings(&self) -> Settings {
        Settings::from_config(self)
    }
}
