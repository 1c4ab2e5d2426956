//! Seam to the key-exchange engine that negotiates SAs.
//!
//! The daemon core never runs a handshake itself. It asks the engine to start
//! one and learns about the result through [`crate::Daemon::sa_ready`].

use std::fmt;

use crate::retransmit::{ExchangeId, PendingMessage};
use crate::sa::{Phase, SecurityAssociation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EstablishReason {
    /// Periodic connection check found no phase-2 SA.
    Connection,
    /// Soft lifetime reached.
    Rekey,
    /// Hard lifetime reached on a stay-alive SA.
    StayAlive,
    /// Soft expiration reported by the kernel.
    KernelExpiry,
}

impl fmt::Display for EstablishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EstablishReason::Connection => "connection",
            EstablishReason::Rekey => "rekey",
            EstablishReason::StayAlive => "stayalive",
            EstablishReason::KernelExpiry => "kernel-expiry",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EstablishRequest {
    pub name: String,
    pub phase: Phase,
    pub reason: EstablishReason,
}

/// What to do about a peer whose worry interval ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessVerdict {
    /// Send another R-U-THERE.
    Probe,
    /// Give up on the peer; the engine tears the SA down.
    PeerDead,
}

pub trait ExchangeEngine {
    /// Starts a negotiation. Must not block.
    fn establish(&mut self, request: EstablishRequest);

    /// Whether a negotiation for `name` in `phase` is already running.
    fn lookup_by_name(&self, name: &str, phase: Phase) -> bool;

    /// Called once after the first transmission of each message.
    fn post_send(&mut self, exchange: ExchangeId, message: &PendingMessage);

    fn liveness_timeout(&mut self, sa: &SecurityAssociation) -> LivenessVerdict;
}
