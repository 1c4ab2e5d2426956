//! Propagation delay of the simulated link.
//!
//! A latency model maps the departure time of a datagram to the earliest
//! instant the far peer can see it. Jitter is added on top by the link.

use std::time::Duration;

use ikewarden_core::Timestamp;

pub trait LatencyModel {
    /// Time a datagram spends on the wire toward peer `to`.
    fn one_way_delay(&self, to: usize) -> Duration;

    fn earliest_arrival(&self, to: usize, departure: Timestamp) -> Timestamp {
        departure + self.one_way_delay(to)
    }
}

/// The same delay in both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymmetricLatency {
    delay: Duration,
}

impl SymmetricLatency {
    pub fn from_millis(ms: u64) -> Self {
        Self {
            delay: Duration::from_millis(ms),
        }
    }
}

impl LatencyModel for SymmetricLatency {
    #[inline]
    fn one_way_delay(&self, _to: usize) -> Duration {
        self.delay
    }
}
