//! Exchange engine stand-in for simulated peers.

use std::collections::HashMap;

use tracing::{debug, info};

use ikewarden_engine::{
    EstablishRequest, ExchangeEngine, ExchangeId, LivenessVerdict, PendingMessage, Phase, SaId,
    SecurityAssociation,
};

/// Unanswered worry intervals tolerated before the peer is declared dead.
pub const DEFAULT_DEAD_AFTER: u32 = 3;

/// Counts worry timeouts per SA since the peer was last heard from.
#[derive(Debug, Default)]
pub struct SimEngine {
    dead_after: u32,
    misses: HashMap<SaId, u32>,
    dead: Vec<SaId>,
    pub establish_requests: Vec<EstablishRequest>,
}

impl SimEngine {
    pub fn new(dead_after: u32) -> Self {
        Self {
            dead_after,
            ..Self::default()
        }
    }

    /// The peer behind `id` answered; start counting from zero again.
    pub fn peer_alive(&mut self, id: SaId) {
        self.misses.remove(&id);
    }

    /// SAs whose peer was declared dead since the last call.
    pub fn take_dead(&mut self) -> Vec<SaId> {
        std::mem::take(&mut self.dead)
    }
}

impl ExchangeEngine for SimEngine {
    fn establish(&mut self, request: EstablishRequest) {
        info!(
            "sim: establish {} phase {} ({})",
            request.name, request.phase, request.reason
        );
        self.establish_requests.push(request);
    }

    fn lookup_by_name(&self, _name: &str, _phase: Phase) -> bool {
        false
    }

    fn post_send(&mut self, _exchange: ExchangeId, _message: &PendingMessage) {}

    fn liveness_timeout(&mut self, sa: &SecurityAssociation) -> LivenessVerdict {
        let misses = self.misses.entry(sa.id).or_insert(0);
        *misses += 1;
        // The first timeout only means nothing has been sent yet.
        if *misses > self.dead_after {
            debug!("sim: {} missed {} intervals", sa.id, *misses - 1);
            self.misses.remove(&sa.id);
            self.dead.push(sa.id);
            LivenessVerdict::PeerDead
        } else {
            LivenessVerdict::Probe
        }
    }
}
