//! ## ikewarden-core::time
//! **Timestamps and clocks**
//!
//! Every scheduled event carries an absolute [`Timestamp`] computed once at
//! schedule time. The daemon never stores "timeouts", only deadlines.
//!
//! ### Clocks:
//! - [`VirtualClock`]: shared atomic counter, advanced explicitly (tests, simulation)
//! - [`SystemClock`]: monotonic wall time measured from an epoch `Instant`

use std::fmt;
use std::ops::Add;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Absolute point in daemon time, in nanoseconds since the clock's epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    #[inline]
    pub const fn from_nanos(ns: u64) -> Self {
        Self(ns)
    }

    #[inline]
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs.saturating_mul(1_000_000_000))
    }

    #[inline]
    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// Whole seconds, truncated.
    #[inline]
    pub const fn as_secs(self) -> u64 {
        self.0 / 1_000_000_000
    }

    /// Time left until `self` as seen from `now`; zero if already passed.
    #[inline]
    pub fn saturating_duration_since(self, now: Timestamp) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(now.0))
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        let ns = u64::try_from(rhs.as_nanos()).unwrap_or(u64::MAX);
        Timestamp(self.0.saturating_add(ns))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:03}s", self.as_secs(), (self.0 % 1_000_000_000) / 1_000_000)
    }
}

/// Source of "now" for the scheduler and everything that computes deadlines.
pub trait Clock {
    fn now(&self) -> Timestamp;
}

/// A simple virtual clock that advances in nanoseconds.
#[derive(Clone, Debug)]
pub struct VirtualClock {
    // Shared so that several daemons in one simulation observe the same time.
    offset: Arc<AtomicU64>,
}

impl VirtualClock {
    /// Creates a new virtual clock starting at `seed` nanoseconds.
    pub fn new(seed: u64) -> Self {
        Self {
            offset: Arc::new(AtomicU64::new(seed)),
        }
    }

    #[inline]
    pub fn now_ns(&self) -> u64 {
        self.offset.load(Ordering::Acquire)
    }

    #[inline]
    pub fn advance(&self, ns: u64) {
        self.offset.fetch_add(ns, Ordering::Release);
    }

    /// Moves the clock forward to `deadline`. Never moves it backwards.
    pub fn advance_to(&self, deadline: Timestamp) {
        self.offset.fetch_max(deadline.as_nanos(), Ordering::AcqRel);
    }
}

impl Clock for VirtualClock {
    #[inline]
    fn now(&self) -> Timestamp {
        Timestamp::from_nanos(self.now_ns())
    }
}

/// Monotonic clock for production use.
#[derive(Clone, Copy, Debug)]
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let elapsed = self.epoch.elapsed().as_nanos();
        Timestamp::from_nanos(u64::try_from(elapsed).unwrap_or(u64::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_initial_value() {
        let clock = VirtualClock::new(100);
        assert_eq!(clock.now_ns(), 100);
    }

    #[test]
    fn test_clock_advance() {
        let clock = VirtualClock::new(0);
        clock.advance(500);
        assert_eq!(clock.now_ns(), 500);
        clock.advance(250);
        assert_eq!(clock.now_ns(), 750);
    }

    #[test]
    fn advance_to_never_rewinds() {
        let clock = VirtualClock::new(0);
        clock.advance_to(Timestamp::from_secs(10));
        clock.advance_to(Timestamp::from_secs(5));
        assert_eq!(clock.now(), Timestamp::from_secs(10));
    }

    #[test]
    fn shared_clones_observe_same_time() {
        let a = VirtualClock::new(0);
        let b = a.clone();
        a.advance(42);
        assert_eq!(b.now_ns(), 42);
    }

    #[test]
    fn timestamp_arithmetic() {
        let t = Timestamp::from_secs(90) + Duration::from_secs(10);
        assert_eq!(t, Timestamp::from_secs(100));
        assert_eq!(
            t.saturating_duration_since(Timestamp::from_secs(40)),
            Duration::from_secs(60)
        );
        assert_eq!(
            Timestamp::from_secs(1).saturating_duration_since(Timestamp::from_secs(2)),
            Duration::ZERO
        );
    }

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
