//! Payloads of the events the daemon schedules.
//!
//! Every variant that names an SA holds one reference on it, released
//! exactly once when the event fires or is cancelled.

use std::net::IpAddr;

use crate::retransmit::MessageId;
use crate::sa::{ProtoId, SaId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerKind {
    SoftExpire(SaId),
    HardExpire(SaId),
    /// DPD worry interval elapsed without proof of life.
    DpdCheck(SaId),
    ConnectionCheck(String),
    Retransmit(MessageId),
    KernelExpire(KernelNotice),
}

impl TimerKind {
    /// The SA this event holds a reference on, if any.
    pub fn sa(&self) -> Option<SaId> {
        match self {
            TimerKind::SoftExpire(id) | TimerKind::HardExpire(id) | TimerKind::DpdCheck(id) => {
                Some(*id)
            }
            _ => None,
        }
    }
}

/// Lifetime expiration reported by the kernel SA installer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelNotice {
    pub dst: IpAddr,
    pub spi: u32,
    pub protocol: ProtoId,
    pub hard: bool,
}
