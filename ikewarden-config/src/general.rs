//! General daemon parameters.
//!
//! Timing knobs for the scheduling/liveness core and capacity bounds for the
//! scheduler and the SA registry. All intervals are in seconds.

use serde::{Deserialize, Serialize};
use validator::{self, Validate};

pub const DEFAULT_CHECK_INTERVAL: u64 = 60;
pub const DEFAULT_RETRANSMITS: u64 = 10;
pub const DEFAULT_RETRANSMIT_BASE: u64 = 5;
pub const DEFAULT_RETRANSMIT_FACTOR: u64 = 2;
pub const DEFAULT_DPD_CHECK_INTERVAL: u64 = 300;
pub const DEFAULT_REKEY_RETRY_INTERVAL: u64 = 60;
pub const DEFAULT_MAX_EVENTS: u64 = 65536;
pub const DEFAULT_MAX_SAS: u64 = 4096;

/// General section.
#[derive(Debug, Serialize, Deserialize, Validate, Clone, PartialEq)]
pub struct GeneralConfig {
    /// Interval between connection liveness checks.
    #[serde(default = "default_check_interval")]
    #[validate(range(min = 1, max = 86400))]
    pub check_interval: u64,

    /// Transmissions of one message after which retransmission is abandoned.
    #[serde(default = "default_retransmits")]
    #[validate(range(max = 100))]
    pub retransmits: u64,

    /// Constant term of the retransmit backoff (`count * factor + base`).
    #[serde(default = "default_retransmit_base")]
    #[validate(range(max = 3600))]
    pub retransmit_base: u64,

    /// Linear term of the retransmit backoff.
    #[serde(default = "default_retransmit_factor")]
    #[validate(range(max = 600))]
    pub retransmit_factor: u64,

    /// DPD worry interval.
    #[serde(default = "default_dpd_check_interval")]
    #[validate(range(min = 1, max = 86400))]
    pub dpd_check_interval: u64,

    /// Delay before retrying a soft-expire that found a rekey in flight.
    #[serde(default = "default_rekey_retry_interval")]
    #[validate(range(min = 1, max = 86400))]
    pub rekey_retry_interval: u64,

    /// Maximum number of pending scheduler events.
    #[serde(default = "default_max_events")]
    #[validate(range(min = 16, max = 16777216))]
    pub max_events: u64,

    /// Maximum number of live security associations.
    #[serde(default = "default_max_sas")]
    #[validate(range(min = 1, max = 1048576))]
    pub max_sas: u64,
}

fn default_check_interval() -> u64 {
    DEFAULT_CHECK_INTERVAL
}

fn default_retransmits() -> u64 {
    DEFAULT_RETRANSMITS
}

fn default_retransmit_base() -> u64 {
    DEFAULT_RETRANSMIT_BASE
}

fn default_retransmit_factor() -> u64 {
    DEFAULT_RETRANSMIT_FACTOR
}

fn default_dpd_check_interval() -> u64 {
    DEFAULT_DPD_CHECK_INTERVAL
}

fn default_rekey_retry_interval() -> u64 {
    DEFAULT_REKEY_RETRY_INTERVAL
}

fn default_max_events() -> u64 {
    DEFAULT_MAX_EVENTS
}

fn default_max_sas() -> u64 {
    DEFAULT_MAX_SAS
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            check_interval: default_check_interval(),
            retransmits: default_retransmits(),
            retransmit_base: default_retransmit_base(),
            retransmit_factor: default_retransmit_factor(),
            dpd_check_interval: default_dpd_check_interval(),
            rekey_retry_interval: default_rekey_retry_interval(),
            max_events: default_max_events(),
            max_sas: default_max_sas(),
        }
    }
}
