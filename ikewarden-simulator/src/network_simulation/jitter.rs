//! # Jitter Models for Simulation
//!
//! ## Models:
//! - `RandomJitterModel`: Adds a uniform random delay from 0 up to a maximum.
//! - `NoJitterModel`: Adds nothing.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

pub trait JitterModel {
    fn apply_jitter(&mut self, base_duration: Duration) -> Duration;
}

/// Uniform jitter in whole milliseconds, drawn from a seeded generator.
#[derive(Debug)]
pub struct RandomJitterModel {
    magnitude_ms: u64,
    rng: SmallRng,
}

impl RandomJitterModel {
    pub fn new(magnitude_ms: u64, seed: u64) -> Self {
        Self {
            magnitude_ms,
            rng: SmallRng::seed_from_u64(seed),
        }
    }
}

impl JitterModel for RandomJitterModel {
    #[inline]
    fn apply_jitter(&mut self, base_duration: Duration) -> Duration {
        let added_ms = self.rng.random_range(0..=self.magnitude_ms);
        base_duration + Duration::from_millis(added_ms)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct NoJitterModel;

impl JitterModel for NoJitterModel {
    #[inline]
    fn apply_jitter(&mut self, base_duration: Duration) -> Duration {
        base_duration
    }
}
