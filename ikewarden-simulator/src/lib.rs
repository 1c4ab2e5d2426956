/*!
# ikewarden Simulator

Deterministic end-to-end harness for the liveness core. Two daemons, an
initiator and a responder, share one virtual clock and a phase-1 SA, and keep
probing each other with Dead Peer Detection over a link with latency, jitter
and packet loss.

## Key Components:
- **Virtual Clock:** both peers observe the same simulated time.
- **Network Models:** fixed latency, seeded jitter and seeded packet loss.
- **Trace Hash:** every send, drop, delivery and timer pass is folded into a
  BLAKE3 hash, so one seed always reproduces the same hash.
- **Replay:** re-runs a configuration and checks it against a recorded hash.
*/

use std::net::SocketAddr;
use std::time::Duration;

use blake3::Hasher;
use bytes::Bytes;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, instrument, warn};
use validator::Validate;

use ikewarden_config::{Settings, SimulatorConfig};
use ikewarden_core::{Clock, Timestamp, VirtualClock};
use ikewarden_engine::{
    Daemon, DaemonError, EstablishReason, SaContext, SaFlags, SaId, TransportId,
};
use ikewarden_protocols::{Cookies, DpdKind, DpdNotify};
use ikewarden_telemetry::MetricsRecorder;

pub mod error;
pub mod link;
pub mod network_simulation;
pub mod peer;
pub mod replay;

pub use error::SimulationError;
pub use peer::SimEngine;

use link::{Link, Outbox, SimTransport};
use network_simulation::jitter::{JitterModel, NoJitterModel, RandomJitterModel};
use network_simulation::latency::SymmetricLatency;
use network_simulation::packet_loss::{
    NoPacketLossModel, PacketLossModel, ProbabilisticLossModel,
};

const CONNECTION_NAME: &str = "sim-peer";
const LINK_CAPACITY: usize = 4096;
const PEER_NAMES: [&str; 2] = ["initiator", "responder"];

/// Counters collected over one run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SimulationStats {
    pub timer_events: u64,
    pub sent: u64,
    pub dropped: u64,
    pub delivered: u64,
    pub rejected: u64,
    pub dead_peers: u64,
    pub rekeys: u64,
    pub connection_attempts: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulationReport {
    pub trace_hash: String,
    pub end: Timestamp,
    pub stats: SimulationStats,
}

struct Peer {
    name: &'static str,
    daemon: Daemon<SimEngine, VirtualClock>,
    outbox: Outbox,
    sa: Option<SaId>,
}

/// Ties the virtual clock, the two daemons and the link together.
pub struct Simulator {
    config: SimulatorConfig,
    clock: VirtualClock,
    peers: [Peer; 2],
    link: Link,
    state_hasher: Hasher,
    stats: SimulationStats,
}

impl Simulator {
    /// Builds both peers and their shared phase-1 SA. `metrics` is shared
    /// by the two daemons.
    pub fn new(config: SimulatorConfig, metrics: MetricsRecorder) -> Result<Self, SimulationError> {
        config
            .validate()
            .map_err(ikewarden_config::ConfigError::from)?;
        let clock = VirtualClock::new(0);
        let mut rng = SmallRng::seed_from_u64(config.seed);
        let cookies = Cookies::new(rng.random(), rng.random());

        let jitter: Box<dyn JitterModel> = if config.network.jitter_ms == 0 {
            Box::new(NoJitterModel)
        } else {
            Box::new(RandomJitterModel::new(config.network.jitter_ms, rng.random()))
        };
        let loss: Box<dyn PacketLossModel> = if config.network.loss_probability == 0.0 {
            Box::new(NoPacketLossModel)
        } else {
            Box::new(ProbabilisticLossModel::new(
                config.network.loss_probability,
                rng.random(),
            )?)
        };
        let link = Link::new(
            LINK_CAPACITY,
            Box::new(SymmetricLatency::from_millis(config.network.latency_ms)),
            jitter,
            loss,
        )?;

        let initiator = Self::peer(PEER_NAMES[0], &clock, &config, &metrics, rng.random(), cookies)?;
        let responder = Self::peer(PEER_NAMES[1], &clock, &config, &metrics, rng.random(), cookies)?;

        Ok(Self {
            config,
            clock,
            peers: [initiator, responder],
            link,
            state_hasher: Hasher::new(),
            stats: SimulationStats::default(),
        })
    }

    fn peer(
        name: &'static str,
        clock: &VirtualClock,
        config: &SimulatorConfig,
        metrics: &MetricsRecorder,
        seed: u64,
        cookies: Cookies,
    ) -> Result<Peer, SimulationError> {
        let mut daemon = Daemon::new(
            SimEngine::new(peer::DEFAULT_DEAD_AFTER),
            clock.clone(),
            Settings::defaults(),
            metrics.clone(),
            seed,
        )?;
        let (transport, outbox) = SimTransport::new(TransportId(0));
        let transport = daemon.add_transport(Box::new(transport))?;

        let ctx = SaContext::phase1(cookies, SocketAddr::from(([198, 51, 100, 1], 500)))
            .named(CONNECTION_NAME)
            .with_flags(SaFlags::DPD_CAPABLE);
        let sa = daemon.create_sa(ctx, transport)?;
        daemon.set_lifetime(sa, config.sa_lifetime_secs, 0)?;
        daemon.setup_expirations(sa)?;
        daemon.sa_ready(sa)?;
        daemon.setup_configured_connections(&config.connections)?;

        Ok(Peer {
            name,
            daemon,
            outbox,
            sa: Some(sa),
        })
    }

    fn record(&mut self, peer: usize, what: &str, data: &[u8]) {
        self.state_hasher
            .update(&self.clock.now().as_nanos().to_be_bytes());
        self.state_hasher.update(self.peers[peer].name.as_bytes());
        self.state_hasher.update(what.as_bytes());
        self.state_hasher.update(data);
    }

    /// Earliest instant anything can happen: a timer or an arrival.
    fn next_wakeup(&self) -> Option<Timestamp> {
        let now = self.clock.now();
        self.peers
            .iter()
            .filter_map(|p| p.daemon.time_until_next().map(|d| now + d))
            .chain(self.link.next_arrival())
            .min()
    }

    /// One pass of the outer loop at the current instant.
    fn step(&mut self) -> Result<(), SimulationError> {
        let now = self.clock.now();

        while let Some(delivery) = self.link.pop_arrived(now) {
            self.deliver(delivery.to, &delivery.datagram);
        }

        for i in 0..self.peers.len() {
            let fired = self.peers[i].daemon.run_due();
            if fired > 0 {
                self.stats.timer_events += fired as u64;
                self.record(i, "timers", &(fired as u64).to_be_bytes());
            }
            self.reap_dead(i);
        }

        for i in 0..self.peers.len() {
            self.peers[i].daemon.flush_transports();
            let pending: Vec<Bytes> = self.peers[i].outbox.borrow_mut().drain(..).collect();
            for datagram in pending {
                self.stats.sent += 1;
                self.record(i, "send", &datagram);
                let to = 1 - i;
                match self.link.transmit(to, datagram, now)? {
                    Some(arrival) => debug!("sim: {} -> {} arrives {arrival}", i, to),
                    None => {
                        self.stats.dropped += 1;
                        self.record(i, "drop", &[]);
                    }
                }
            }
        }
        Ok(())
    }

    fn deliver(&mut self, to: usize, datagram: &[u8]) {
        self.stats.delivered += 1;
        self.record(to, "recv", datagram);

        let kind = DpdNotify::from_datagram(datagram).map(|(_, notify)| notify.kind);
        let peer = &mut self.peers[to];
        match peer.daemon.handle_dpd(datagram) {
            Ok(()) => {
                if let Some(sa) = peer.sa {
                    peer.daemon.engine_mut().peer_alive(sa);
                }
                if matches!(kind, Ok(DpdKind::RUThereAck)) {
                    debug!("sim: {} got ack", peer.name);
                }
            }
            Err(DaemonError::NoSa(cookies)) => {
                debug!("sim: {} has no SA for {cookies}", peer.name);
                self.record(to, "nosa", &[]);
            }
            Err(e) => {
                warn!("sim: {} rejected datagram: {e}", peer.name);
                self.stats.rejected += 1;
                self.record(to, "reject", &[]);
            }
        }
    }

    fn reap_dead(&mut self, i: usize) {
        let engine = self.peers[i].daemon.engine_mut();
        for request in engine.establish_requests.drain(..) {
            match request.reason {
                EstablishReason::Connection => self.stats.connection_attempts += 1,
                _ => self.stats.rekeys += 1,
            }
        }
        let dead = engine.take_dead();

        for sa in dead {
            let peer = &mut self.peers[i];
            info!("sim: {} declares peer dead, deleting {sa}", peer.name);
            peer.daemon.delete_sa(sa);
            self.stats.dead_peers += 1;
            self.record(i, "dead", &sa.0.to_be_bytes());
        }
        let peer = &mut self.peers[i];
        if peer.sa.is_some_and(|sa| peer.daemon.sa(sa).is_none()) {
            peer.sa = None;
        }
    }

    /// Runs until the configured duration has elapsed or nothing is left
    /// to happen.
    #[instrument(level = "info", skip(self), fields(seed = self.config.seed))]
    pub fn run(&mut self) -> Result<SimulationReport, SimulationError> {
        let end = Timestamp::ZERO + Duration::from_secs(self.config.duration_secs);
        info!(
            "sim: {}s, latency {}ms, jitter {}ms, loss {}",
            self.config.duration_secs,
            self.config.network.latency_ms,
            self.config.network.jitter_ms,
            self.config.network.loss_probability
        );
        loop {
            self.step()?;
            match self.next_wakeup() {
                Some(next) if next <= end => self.clock.advance_to(next),
                _ => break,
            }
        }
        self.clock.advance_to(end);

        for peer in &self.peers {
            for line in peer.daemon.report() {
                self.state_hasher.update(line.as_bytes());
            }
        }
        let trace_hash = hex::encode(self.state_hasher.finalize().as_bytes());
        info!("sim: finished, trace hash {trace_hash}");
        Ok(SimulationReport {
            trace_hash,
            end: self.clock.now(),
            stats: self.stats.clone(),
        })
    }

    /// Whether each peer still holds its SA.
    pub fn sa_alive(&self) -> [bool; 2] {
        [self.peers[0].sa.is_some(), self.peers[1].sa.is_some()]
    }
}

/// Builds and runs a simulation in one call.
pub fn simulate(
    config: SimulatorConfig,
    metrics: MetricsRecorder,
) -> Result<SimulationReport, SimulationError> {
    Simulator::new(config, metrics)?.run()
}
