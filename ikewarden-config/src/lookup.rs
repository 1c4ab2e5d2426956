//! Point-of-use numeric lookups.
//!
//! The daemon core reads its tunables through [`ConfigLookup::get_num`] at the
//! moment it needs them, so a reload only has to swap the [`Settings`].

use figment::providers::Serialized;
use figment::Figment;
use tracing::trace;

use crate::IkewardenConfig;

/// Numeric configuration lookup by section and key.
pub trait ConfigLookup {
    /// Returns the value at `section.key`, or `default` when it is absent or
    /// not a non-negative integer.
    fn get_num(&self, section: &str, key: &str, default: u64) -> u64;
}

/// Figment-backed lookup over an effective configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    figment: Figment,
}

impl Settings {
    pub fn new(figment: Figment) -> Self {
        Self { figment }
    }

    /// Settings that only carry the built-in defaults.
    pub fn defaults() -> Self {
        Self::from_config(&IkewardenConfig::default())
    }

    pub fn from_config(config: &IkewardenConfig) -> Self {
        Self::new(Figment::from(Serialized::defaults(config)))
    }

    /// Overrides a single value; mainly for tests and the simulator.
    pub fn with(self, section: &str, key: &str, value: u64) -> Self {
        let path = format!("{section}.{key}");
        Self::new(self.figment.merge(Serialized::default(&path, value)))
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::defaults()
    }
}

impl ConfigLookup for Settings {
    fn get_num(&self, section: &str, key: &str, default: u64) -> u64 {
        let path = format!("{section}.{key}");
        match self.figment.extract_inner::<u64>(&path) {
            Ok(value) => value,
            Err(_) => {
                trace!("get_num: {path} not set, using {default}");
                default
            }
        }
    }
}
