//! Error types of the daemon core.

use thiserror::Error;

use ikewarden_core::SchedulerError;
use ikewarden_protocols::{Cookies, NotifyParseError};

use crate::sa::SaId;
use crate::transport::TransportId;

/// Malformed or out-of-window liveness traffic. The offending message is
/// dropped; the SA it names is left alone.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    #[error("payload malformed: {0}")]
    PayloadMalformed(String),
    #[error("notify SPI does not match the SA cookies")]
    InvalidSpi,
    #[error("notify not valid in {0} exchange")]
    InvalidExchangeType(String),
}

impl From<NotifyParseError> for ProtocolViolation {
    fn from(error: NotifyParseError) -> Self {
        ProtocolViolation::PayloadMalformed(error.to_string())
    }
}

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("allocation failed: {0}")]
    Allocation(#[from] SchedulerError),

    #[error("SA table full ({capacity} entries)")]
    SaCapacity { capacity: usize },

    #[error("duplicate {0}")]
    Duplicate(String),

    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    #[error("unknown SA {0}")]
    UnknownSa(SaId),

    #[error("no SA for cookies {0}")]
    NoSa(Cookies),

    #[error("unknown transport {0}")]
    UnknownTransport(TransportId),
}

impl DaemonError {
    /// Whether the failure is an exhausted capacity rather than bad input.
    pub fn is_allocation(&self) -> bool {
        matches!(
            self,
            DaemonError::Allocation(_) | DaemonError::SaCapacity { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, DaemonError>;
