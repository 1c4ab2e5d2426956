//! # Packet Loss Models for Simulation
//!
//! ## Models:
//! - `ProbabilisticLossModel`: Drops datagrams with a given probability.
//! - `NoPacketLossModel`: Never drops.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::error::SimulationError;

pub trait PacketLossModel {
    /// Whether the next datagram is lost.
    fn should_drop(&mut self) -> bool;
}

#[derive(Debug)]
pub struct ProbabilisticLossModel {
    /// Drop probability (0.0 to 1.0)
    drop_probability: f64,
    rng: SmallRng,
}

impl ProbabilisticLossModel {
    pub fn new(drop_probability: f64, seed: u64) -> Result<Self, SimulationError> {
        if !(0.0..=1.0).contains(&drop_probability) {
            return Err(SimulationError::InvalidLossProbability(drop_probability));
        }
        Ok(Self {
            drop_probability,
            rng: SmallRng::seed_from_u64(seed),
        })
    }
}

impl PacketLossModel for ProbabilisticLossModel {
    #[inline]
    fn should_drop(&mut self) -> bool {
        self.rng.random_bool(self.drop_probability)
    }
}

#[derive(Debug)]
pub struct NoPacketLossModel;

impl PacketLossModel for NoPacketLossModel {
    #[inline]
    fn should_drop(&mut self) -> bool {
        false
    }
}
