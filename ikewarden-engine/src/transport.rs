//! Datagram transports the retransmission manager drains.

use std::fmt;
use std::io;

/// Stable identity of a transport for the lifetime of the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransportId(pub u32);

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transport#{}", self.0)
    }
}

pub trait Transport {
    fn id(&self) -> TransportId;

    /// Hands one datagram to the network. Errors are not escalated by the
    /// caller; a scheduled retry covers them.
    fn send(&mut self, datagram: &[u8]) -> io::Result<()>;
}
