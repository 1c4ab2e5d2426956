//! ## ikewarden-simulator::network_simulation
//! **Impairments of the simulated link between the two peers**
//!
//! ### Key Submodules:
//! - `latency/`: propagation delay from departure to earliest arrival
//! - `jitter/`: seeded random extra delay
//! - `packet_loss/`: seeded probabilistic drops
//!
//! Every random model takes a seed so a run is reproducible.

pub mod jitter;
pub mod latency;
pub mod packet_loss;
