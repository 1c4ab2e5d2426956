//! ## ikewarden-engine::daemon
//! **Daemon context: one instance of every component plus timer dispatch**
//!
//! The outer loop of a daemon is:
//!
//! ```text
//! loop {
//!     wait for I/O, at most time_until_next()
//!     run_due()
//!     handle readable transports, flush_transports()
//! }
//! ```
//!
//! Fired events are dispatched by matching on [`TimerKind`]. Every handler
//! runs to completion before the next event is popped.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use opentelemetry::KeyValue;
use tracing::{debug, error, info, instrument, trace, warn};

use ikewarden_config::{
    ConfigLookup, ConnectionsConfig, DEFAULT_DPD_CHECK_INTERVAL, DEFAULT_MAX_EVENTS,
    DEFAULT_MAX_SAS, DEFAULT_REKEY_RETRY_INTERVAL,
};
use ikewarden_core::{Clock, Event, Scheduler, SystemClock, Timestamp};
use ikewarden_protocols::header::PAYLOAD_NOTIFY;
use ikewarden_protocols::{
    ExchangeType, IsakmpHeader, NotifyParseError, NotifyPayload, HEADER_LEN, NOTIFY_R_U_THERE,
    NOTIFY_R_U_THERE_ACK,
};
use ikewarden_telemetry::{EventLogger, MetricsRecorder};

use crate::connection::ConnectionSupervisor;
use crate::dpd::{reset_worry_timer, DpdEngine};
use crate::error::{DaemonError, ProtocolViolation, Result};
use crate::exchange::{EstablishReason, EstablishRequest, ExchangeEngine, LivenessVerdict};
use crate::registry::SaRegistry;
use crate::retransmit::{ExchangeId, MessageId, Received, Retransmitter, SendOutcome};
use crate::sa::{Phase, SaContext, SaFlags, SaId, SecurityAssociation};
use crate::timer::{KernelNotice, TimerKind};
use crate::transport::{Transport, TransportId};

pub struct Daemon<E, C = SystemClock> {
    clock: C,
    scheduler: Scheduler<TimerKind>,
    registry: SaRegistry,
    connections: ConnectionSupervisor,
    retransmitter: Retransmitter,
    dpd: DpdEngine,
    transports: BTreeMap<TransportId, Box<dyn Transport>>,
    engine: E,
    settings: Box<dyn ConfigLookup>,
    metrics: MetricsRecorder,
}

impl<E: ExchangeEngine, C: Clock> Daemon<E, C> {
    /// Builds a daemon. Capacities come from `settings`; `seed` drives the
    /// DPD sequence and message id generator.
    pub fn new(
        engine: E,
        clock: C,
        settings: impl ConfigLookup + 'static,
        metrics: MetricsRecorder,
        seed: u64,
    ) -> Result<Self> {
        let max_events = settings.get_num("general", "max_events", DEFAULT_MAX_EVENTS);
        let max_sas = settings.get_num("general", "max_sas", DEFAULT_MAX_SAS);
        Ok(Self {
            clock,
            scheduler: Scheduler::with_capacity(usize::try_from(max_events).unwrap_or(usize::MAX))?,
            registry: SaRegistry::new(
                usize::try_from(max_sas).unwrap_or(usize::MAX),
                metrics.clone(),
            ),
            connections: ConnectionSupervisor::new(metrics.clone()),
            retransmitter: Retransmitter::new(metrics.clone()),
            dpd: DpdEngine::new(seed, metrics.clone()),
            transports: BTreeMap::new(),
            engine,
            settings: Box::new(settings),
            metrics,
        })
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn add_transport(&mut self, transport: Box<dyn Transport>) -> Result<TransportId> {
        let id = transport.id();
        if self.transports.contains_key(&id) {
            return Err(DaemonError::Duplicate(format!("transport {id}")));
        }
        self.transports.insert(id, transport);
        Ok(id)
    }

    // Scheduling

    /// Time until the next event, bounding the outer loop's I/O wait.
    pub fn time_until_next(&self) -> Option<Duration> {
        self.scheduler.time_until_next(self.clock.now())
    }

    /// Fires every due event in deadline order. Events scheduled while
    /// running with an already-passed deadline fire in the same call.
    #[instrument(level = "trace", skip(self))]
    pub fn run_due(&mut self) -> usize {
        let mut fired = 0;
        while let Some(event) = self.scheduler.pop_due(self.clock.now()) {
            fired += 1;
            self.dispatch(event);
        }
        fired
    }

    fn dispatch(&mut self, event: Event<TimerKind>) {
        trace!("timer_handle_expirations: {} due {}", event.name, event.deadline);
        match event.kind {
            TimerKind::SoftExpire(id) => self.soft_expire(id, true, EstablishReason::Rekey),
            TimerKind::HardExpire(id) => self.hard_expire(id, true),
            TimerKind::DpdCheck(id) => self.dpd_timeout(id),
            TimerKind::ConnectionCheck(name) => {
                let now = self.clock.now();
                self.connections.periodic_check(
                    &name,
                    &mut self.scheduler,
                    &self.registry,
                    &mut self.engine,
                    self.settings.as_ref(),
                    now,
                );
            }
            TimerKind::Retransmit(id) => {
                self.retransmitter.retry_fired(id);
            }
            TimerKind::KernelExpire(notice) => self.kernel_expire(notice),
        }
    }

    // Connections

    pub fn setup_connection(&mut self, name: &str) -> Result<()> {
        let now = self.clock.now();
        self.connections.setup(name, &mut self.scheduler, now)
    }

    /// Registers every always-up connection of the loaded configuration.
    /// Names that are already registered are skipped.
    pub fn setup_configured_connections(&mut self, config: &ConnectionsConfig) -> Result<usize> {
        let mut added = 0;
        for name in &config.phase2 {
            match self.setup_connection(name) {
                Ok(()) => added += 1,
                Err(DaemonError::Duplicate(what)) => {
                    warn!("connection_setup: skipping {what}, already registered")
                }
                Err(e) => return Err(e),
            }
        }
        Ok(added)
    }

    pub fn teardown_connection(&mut self, name: &str) -> bool {
        self.connections.teardown(name, &mut self.scheduler)
    }

    // Security associations

    pub fn create_sa(&mut self, ctx: SaContext, transport: TransportId) -> Result<SaId> {
        if !self.transports.contains_key(&transport) {
            return Err(DaemonError::UnknownTransport(transport));
        }
        self.registry.create(ctx, transport)
    }

    pub fn sa(&self, id: SaId) -> Option<&SecurityAssociation> {
        self.registry.get(id)
    }

    pub fn set_lifetime(&mut self, id: SaId, seconds: u64, kilobytes: u64) -> Result<()> {
        let sa = self.registry.get_mut(id).ok_or(DaemonError::UnknownSa(id))?;
        sa.seconds = seconds;
        sa.kilobytes = kilobytes;
        Ok(())
    }

    pub fn setup_expirations(&mut self, id: SaId) -> Result<()> {
        let now = self.clock.now();
        self.registry.setup_expirations(id, &mut self.scheduler, now)
    }

    pub fn reference_sa(&mut self, id: SaId) -> Result<()> {
        self.registry.reference(id)
    }

    pub fn release_sa(&mut self, id: SaId) -> bool {
        self.registry.release(id, &mut self.scheduler)
    }

    pub fn delete_sa(&mut self, id: SaId) {
        self.registry.delete(id, &mut self.scheduler);
    }

    /// Called by the exchange engine once negotiation of `id` has finished.
    ///
    /// Older SAs with the same name and phase are marked replaced. A phase-1
    /// SA whose peer announced DPD starts liveness checking.
    pub fn sa_ready(&mut self, id: SaId) -> Result<()> {
        let sa = self
            .registry
            .get_mut(id)
            .filter(|sa| sa.is_linked())
            .ok_or(DaemonError::UnknownSa(id))?;
        sa.flags.insert(SaFlags::READY);
        let start_dpd = sa.phase == Phase::One && sa.flags.contains(SaFlags::DPD_CAPABLE);
        if start_dpd {
            sa.flags.insert(SaFlags::DPD_ACTIVE);
        }
        let name = sa.name.clone();
        let phase = sa.phase;
        info!("sa_ready: {id} phase {phase} {}", name.as_deref().unwrap_or("-"));

        if let Some(name) = name {
            let older: Vec<SaId> = self
                .registry
                .iter()
                .filter(|other| {
                    other.id != id
                        && other.is_linked()
                        && other.phase == phase
                        && other.name.as_deref() == Some(name.as_str())
                })
                .map(|other| other.id)
                .collect();
            for old in older {
                self.registry.mark_replaced(old);
            }
        }
        if start_dpd {
            let deadline = self.worry_deadline();
            reset_worry_timer(&mut self.registry, &mut self.scheduler, id, deadline)?;
        }
        Ok(())
    }

    /// Queues a kernel expiration notice to be handled in timer order.
    pub fn kernel_expiration(&mut self, notice: KernelNotice) -> Result<()> {
        let now = self.clock.now();
        // Never cancelled: the handle is not kept.
        let _ = self
            .scheduler
            .schedule("kernel_expire", TimerKind::KernelExpire(notice), now)?;
        Ok(())
    }

    fn soft_expire(&mut self, id: SaId, timer_ref: bool, reason: EstablishReason) {
        if timer_ref {
            if let Some(sa) = self.registry.get_mut(id) {
                sa.soft_timer = None;
            }
        }
        let target = self
            .registry
            .get(id)
            .filter(|sa| sa.is_linked() && !sa.flags.contains(SaFlags::REPLACED))
            .and_then(|sa| sa.name.clone().map(|name| (name, sa.phase)));

        match target {
            Some((name, phase)) if self.engine.lookup_by_name(&name, phase) => {
                debug!("sa_soft_expire: {id} rekey of {name} already running, deferring");
                self.defer_rekey(id);
            }
            Some((name, phase)) => {
                info!("sa_soft_expire: {id} rekeying {name} ({reason})");
                self.engine.establish(EstablishRequest {
                    name,
                    phase,
                    reason,
                });
            }
            None => debug!("sa_soft_expire: {id} not rekeyed"),
        }

        if timer_ref {
            self.registry.release(id, &mut self.scheduler);
        }
    }

    fn defer_rekey(&mut self, id: SaId) {
        let retry = self.settings.get_num(
            "general",
            "rekey_retry_interval",
            DEFAULT_REKEY_RETRY_INTERVAL,
        );
        let deadline = self.clock.now() + Duration::from_secs(retry);
        let handle = match self.registry.arm(
            id,
            &mut self.scheduler,
            "sa_soft_expire",
            TimerKind::SoftExpire(id),
            deadline,
        ) {
            Ok(handle) => handle,
            Err(e) => {
                error!("sa_soft_expire: cannot defer rekey of {id}: {e}");
                return;
            }
        };
        let previous = self
            .registry
            .get_mut(id)
            .and_then(|sa| sa.soft_timer.replace(handle));
        if let Some(previous) = previous {
            if self.scheduler.cancel(previous).is_some() {
                self.registry.release(id, &mut self.scheduler);
            }
        }
    }

    fn hard_expire(&mut self, id: SaId, timer_ref: bool) {
        let mut stayalive = None;
        if let Some(sa) = self.registry.get_mut(id) {
            if timer_ref {
                sa.hard_timer = None;
            }
            if sa.is_linked() {
                sa.flags.insert(SaFlags::FADING);
                if sa.flags.contains(SaFlags::STAYALIVE)
                    && !sa.flags.contains(SaFlags::REPLACED)
                {
                    stayalive = sa.name.clone().map(|name| (name, sa.phase));
                }
            }
        }

        if let Some((name, phase)) = stayalive {
            if self.engine.lookup_by_name(&name, phase) {
                debug!("sa_hard_expire: {id} {name} already being renegotiated");
            } else {
                self.engine.establish(EstablishRequest {
                    name,
                    phase,
                    reason: EstablishReason::StayAlive,
                });
            }
        }

        if self.registry.is_live(id) {
            info!("sa_hard_expire: {id} expired");
            self.registry.delete(id, &mut self.scheduler);
        }
        if timer_ref {
            self.registry.release(id, &mut self.scheduler);
        }
    }

    fn kernel_expire(&mut self, notice: KernelNotice) {
        let spi = notice.spi.to_be_bytes();
        let Some(id) = self.registry.lookup(notice.dst, &spi, notice.protocol) else {
            debug!(
                "pf_key_v2_expire: no SA for {} spi {:#010x} {:?}",
                notice.dst, notice.spi, notice.protocol
            );
            return;
        };
        if notice.hard {
            self.hard_expire(id, false);
        } else {
            self.soft_expire(id, false, EstablishReason::KernelExpiry);
        }
    }

    // Dead peer detection

    fn worry_deadline(&self) -> Timestamp {
        let interval = self.settings.get_num(
            "general",
            "dpd_check_interval",
            DEFAULT_DPD_CHECK_INTERVAL,
        );
        self.clock.now() + Duration::from_secs(interval)
    }

    /// DPD vendor ID payload for `exchange`, only the first time it is asked.
    pub fn vendor_marker(&mut self, exchange: ExchangeId) -> Option<Bytes> {
        self.dpd.vendor_marker(exchange)
    }

    pub fn check_vendor_marker(
        &mut self,
        exchange: ExchangeId,
        id: SaId,
        vendor_ids: &[&[u8]],
    ) -> Result<bool> {
        let sa = self.registry.get_mut(id).ok_or(DaemonError::UnknownSa(id))?;
        Ok(self.dpd.check_vendor_marker(exchange, sa, vendor_ids))
    }

    /// Queues an R-U-THERE for `id` and arms the worry timer.
    pub fn send_dpd_probe(&mut self, id: SaId) -> Result<MessageId> {
        let sa = self
            .registry
            .get_mut(id)
            .filter(|sa| sa.is_linked())
            .ok_or(DaemonError::UnknownSa(id))?;
        let notify = self.dpd.send_notify(sa);
        let transport = sa.transport;
        let datagram = notify.to_datagram(self.dpd.message_id());
        let exchange = self.retransmitter.begin_exchange();
        let message = self
            .retransmitter
            .enqueue(transport, exchange, datagram, true, false);

        let deadline = self.worry_deadline();
        reset_worry_timer(&mut self.registry, &mut self.scheduler, id, deadline)?;
        Ok(message)
    }

    /// Handles an informational datagram carrying a DPD notify.
    #[instrument(level = "debug", skip(self, datagram), fields(len = datagram.len()))]
    pub fn handle_dpd(&mut self, datagram: &[u8]) -> Result<()> {
        let header = match IsakmpHeader::parse(datagram) {
            Ok(header) => header,
            Err(e) => {
                let violation = ProtocolViolation::from(NotifyParseError::from(e));
                self.dpd.report_violation("unparsed datagram", &violation);
                return Err(violation.into());
            }
        };
        let Some(id) = self
            .registry
            .lookup_by_cookies(header.cookies.initiator, header.cookies.responder)
        else {
            debug!("dpd_handle_notify: no SA for {}", header.cookies);
            return Err(DaemonError::NoSa(header.cookies));
        };

        let result = self.process_notify(id, &header, &datagram[HEADER_LEN..]);
        if let Err(DaemonError::Protocol(violation)) = &result {
            self.dpd.report_violation(id, violation);
        }
        result
    }

    fn process_notify(&mut self, id: SaId, header: &IsakmpHeader, body: &[u8]) -> Result<()> {
        if header.exchange_type != ExchangeType::Informational {
            return Err(ProtocolViolation::InvalidExchangeType(format!(
                "{:?}",
                header.exchange_type
            ))
            .into());
        }
        if header.next_payload != PAYLOAD_NOTIFY {
            return Err(ProtocolViolation::from(NotifyParseError::UnexpectedPayload(
                header.next_payload,
            ))
            .into());
        }
        let (payload, _) = NotifyPayload::parse(body).map_err(ProtocolViolation::from)?;
        let sa = self.registry.get_mut(id).ok_or(DaemonError::UnknownSa(id))?;

        match payload.notify_type {
            NOTIFY_R_U_THERE => {
                self.dpd.recv_notify(sa, &payload)?;
                let ack = self.dpd.send_ack(sa);
                let transport = sa.transport;
                let datagram = ack.to_datagram(self.dpd.message_id());
                let exchange = self.retransmitter.begin_exchange();
                self.retransmitter
                    .enqueue(transport, exchange, datagram, true, false);
            }
            NOTIFY_R_U_THERE_ACK => {
                self.dpd.recv_ack(sa, &payload)?;
            }
            other => {
                return Err(ProtocolViolation::PayloadMalformed(format!(
                    "notify type {other} is not DPD"
                ))
                .into());
            }
        }

        // Either direction proves the peer alive.
        let deadline = self.worry_deadline();
        reset_worry_timer(&mut self.registry, &mut self.scheduler, id, deadline)
    }

    fn dpd_timeout(&mut self, id: SaId) {
        if let Some(sa) = self.registry.get_mut(id) {
            sa.dpd_timer = None;
        }
        self.registry.release(id, &mut self.scheduler);

        let verdict = match self.registry.get(id) {
            Some(sa) if sa.is_linked() && sa.flags.contains(SaFlags::DPD_ACTIVE) => {
                self.engine.liveness_timeout(sa)
            }
            _ => {
                debug!("dpd_event: {id} no longer checked");
                return;
            }
        };
        match verdict {
            LivenessVerdict::Probe => {
                if let Err(e) = self.send_dpd_probe(id) {
                    error!("dpd_event: cannot probe {id}: {e}");
                }
            }
            LivenessVerdict::PeerDead => {
                warn!("dpd_event: peer of {id} is dead");
                EventLogger::log_event("dpd_peer_dead", vec![KeyValue::new("sa", id.to_string())]);
            }
        }
    }

    // Messages

    pub fn begin_exchange(&mut self) -> ExchangeId {
        self.retransmitter.begin_exchange()
    }

    pub fn end_exchange(&mut self, exchange: ExchangeId) {
        self.retransmitter.end_exchange(exchange, &mut self.scheduler);
        self.dpd.forget_exchange(exchange);
    }

    pub fn send_message(
        &mut self,
        transport: TransportId,
        exchange: ExchangeId,
        payload: Bytes,
        is_final: bool,
        prioritized: bool,
    ) -> Result<MessageId> {
        if !self.transports.contains_key(&transport) {
            return Err(DaemonError::UnknownTransport(transport));
        }
        Ok(self
            .retransmitter
            .enqueue(transport, exchange, payload, is_final, prioritized))
    }

    /// Duplicate suppression for an incoming exchange packet.
    pub fn receive(&mut self, exchange: ExchangeId, packet: &[u8]) -> Received {
        self.retransmitter
            .on_received(exchange, packet, &mut self.scheduler)
    }

    pub fn on_writable(&mut self, transport: TransportId) -> Result<Option<SendOutcome>> {
        let now = self.clock.now();
        let link = self
            .transports
            .get_mut(&transport)
            .ok_or(DaemonError::UnknownTransport(transport))?;
        Ok(self.retransmitter.on_writable(
            link.as_mut(),
            &mut self.scheduler,
            &mut self.engine,
            self.settings.as_ref(),
            now,
        ))
    }

    /// Drains every send queue. Returns the number of transmissions.
    pub fn flush_transports(&mut self) -> usize {
        let mut sent = 0;
        for transport in self.retransmitter.busy_transports() {
            loop {
                match self.on_writable(transport) {
                    Ok(Some(_)) => sent += 1,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("flush_transports: {e}");
                        break;
                    }
                }
            }
        }
        sent
    }

    // Introspection

    /// Logs and returns one line per SA and connection.
    pub fn report(&self) -> Vec<String> {
        fn at(deadline: Option<Timestamp>) -> String {
            deadline.map_or_else(|| "-".to_owned(), |t| t.to_string())
        }

        let mut sas: Vec<&SecurityAssociation> = self.registry.iter().collect();
        sas.sort_by_key(|sa| sa.id);
        let mut lines: Vec<String> = sas
            .into_iter()
            .map(|sa| {
                format!(
                    "{} phase {} name {} cookies {} flags {} refcnt {} soft {} hard {} dpd {}",
                    sa.id,
                    sa.phase,
                    sa.name.as_deref().unwrap_or("-"),
                    sa.cookies,
                    sa.flags,
                    sa.refcnt(),
                    at(sa.soft_deadline()),
                    at(sa.hard_deadline()),
                    at(sa.dpd_deadline()),
                )
            })
            .collect();
        lines.extend(self.connections.iter().map(|conn| {
            format!(
                "connection {} {} next check {}",
                conn.name,
                conn.state,
                at(conn.next_check())
            )
        }));
        for line in &lines {
            info!("{line}");
        }
        lines
    }

    pub fn registry(&self) -> &SaRegistry {
        &self.registry
    }

    pub fn connections(&self) -> &ConnectionSupervisor {
        &self.connections
    }

    pub fn retransmitter(&self) -> &Retransmitter {
        &self.retransmitter
    }

    pub fn scheduler(&self) -> &Scheduler<TimerKind> {
        &self.scheduler
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn metrics(&self) -> &MetricsRecorder {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retransmit::PendingMessage;
    use crate::sa::{Proto, ProtoId};
    use ikewarden_config::Settings;
    use ikewarden_core::VirtualClock;
    use ikewarden_protocols::{Cookies, DpdNotify};
    use std::cell::RefCell;
    use std::io;
    use std::net::SocketAddr;
    use std::rc::Rc;
    use tracing_test::traced_test;

    type Outbox = Rc<RefCell<Vec<Bytes>>>;

    struct Pipe {
        id: TransportId,
        out: Outbox,
    }

    impl Transport for Pipe {
        fn id(&self) -> TransportId {
            self.id
        }

        fn send(&mut self, datagram: &[u8]) -> io::Result<()> {
            self.out.borrow_mut().push(Bytes::copy_from_slice(datagram));
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockEngine {
        requests: Vec<EstablishRequest>,
        in_flight: Vec<String>,
        dead: bool,
        timeouts: Vec<SaId>,
        post_sends: usize,
    }

    impl ExchangeEngine for MockEngine {
        fn establish(&mut self, request: EstablishRequest) {
            self.requests.push(request);
        }

        fn lookup_by_name(&self, name: &str, _phase: Phase) -> bool {
            self.in_flight.iter().any(|n| n == name)
        }

        fn post_send(&mut self, _exchange: ExchangeId, _message: &PendingMessage) {
            self.post_sends += 1;
        }

        fn liveness_timeout(&mut self, sa: &SecurityAssociation) -> LivenessVerdict {
            self.timeouts.push(sa.id);
            if self.dead {
                LivenessVerdict::PeerDead
            } else {
                LivenessVerdict::Probe
            }
        }
    }

    const LINK: TransportId = TransportId(1);

    fn peer() -> SocketAddr {
        "203.0.113.5:500".parse().unwrap()
    }

    fn cookies() -> Cookies {
        Cookies::new([0xa1; 8], [0xb2; 8])
    }

    fn secs(s: u64) -> Timestamp {
        Timestamp::from_secs(s)
    }

    fn daemon(clock: &VirtualClock, seed: u64) -> (Daemon<MockEngine, VirtualClock>, Outbox) {
        let out: Outbox = Rc::default();
        let mut d = Daemon::new(
            MockEngine::default(),
            clock.clone(),
            Settings::defaults(),
            MetricsRecorder::new(),
            seed,
        )
        .unwrap();
        d.add_transport(Box::new(Pipe {
            id: LINK,
            out: out.clone(),
        }))
        .unwrap();
        (d, out)
    }

    fn dpd_pair(d: &mut Daemon<MockEngine, VirtualClock>) -> SaId {
        let ctx = SaContext::phase1(cookies(), peer())
            .named("peer")
            .with_flags(SaFlags::DPD_CAPABLE);
        let id = d.create_sa(ctx, LINK).unwrap();
        d.sa_ready(id).unwrap();
        id
    }

    fn take(out: &Outbox) -> Vec<Bytes> {
        std::mem::take(&mut *out.borrow_mut())
    }

    #[test]
    fn sa_expiry_rekeys_once_then_releases() {
        let clock = VirtualClock::new(0);
        let (mut d, _) = daemon(&clock, 1);
        let ctx = SaContext::phase2(cookies(), [0, 0, 0, 1], peer()).named("vpn1");
        let id = d.create_sa(ctx, LINK).unwrap();
        d.set_lifetime(id, 100, 0).unwrap();
        d.setup_expirations(id).unwrap();

        let sa = d.sa(id).unwrap();
        assert_eq!(sa.soft_deadline(), Some(secs(90)));
        assert_eq!(sa.hard_deadline(), Some(secs(100)));

        clock.advance_to(secs(89));
        assert_eq!(d.run_due(), 0);
        clock.advance_to(secs(90));
        assert_eq!(d.run_due(), 1);
        assert_eq!(
            d.engine().requests,
            vec![EstablishRequest {
                name: "vpn1".into(),
                phase: Phase::Two,
                reason: EstablishReason::Rekey,
            }]
        );

        clock.advance_to(secs(100));
        assert_eq!(d.run_due(), 1);
        assert!(d.sa(id).is_none());
        assert_eq!(d.engine().requests.len(), 1);
        assert!(d.time_until_next().is_none());
    }

    #[test]
    fn replaced_sa_does_not_rekey() {
        let clock = VirtualClock::new(0);
        let (mut d, _) = daemon(&clock, 1);
        let old = d
            .create_sa(
                SaContext::phase2(cookies(), [0, 0, 0, 1], peer()).named("vpn1"),
                LINK,
            )
            .unwrap();
        d.set_lifetime(old, 100, 0).unwrap();
        d.setup_expirations(old).unwrap();
        let new = d
            .create_sa(
                SaContext::phase2(cookies(), [0, 0, 0, 2], peer()).named("vpn1"),
                LINK,
            )
            .unwrap();
        d.sa_ready(new).unwrap();
        assert!(d.sa(old).unwrap().flags.contains(SaFlags::REPLACED));

        clock.advance_to(secs(100));
        d.run_due();
        assert!(d.engine().requests.is_empty());
        assert!(d.sa(old).is_none());
        assert!(d.sa(new).is_some());
    }

    #[test]
    fn soft_expiry_defers_while_rekey_in_flight() {
        let clock = VirtualClock::new(0);
        let (mut d, _) = daemon(&clock, 1);
        let id = d
            .create_sa(
                SaContext::phase2(cookies(), [0, 0, 0, 1], peer()).named("vpn1"),
                LINK,
            )
            .unwrap();
        d.set_lifetime(id, 1000, 0).unwrap();
        d.setup_expirations(id).unwrap();
        d.engine_mut().in_flight.push("vpn1".into());

        clock.advance_to(secs(900));
        d.run_due();
        assert!(d.engine().requests.is_empty());
        assert_eq!(d.sa(id).unwrap().soft_deadline(), Some(secs(960)));
        assert_eq!(d.sa(id).unwrap().refcnt(), 3);

        d.engine_mut().in_flight.clear();
        clock.advance_to(secs(960));
        d.run_due();
        assert_eq!(d.engine().requests.len(), 1);
        assert_eq!(d.sa(id).unwrap().refcnt(), 2);

        clock.advance_to(secs(1000));
        d.run_due();
        assert!(d.sa(id).is_none());
        assert!(d.scheduler().is_empty());
    }

    #[test]
    fn stayalive_hard_expiry_reestablishes() {
        let clock = VirtualClock::new(0);
        let (mut d, _) = daemon(&clock, 1);
        let ctx = SaContext::phase2(cookies(), [0, 0, 0, 1], peer())
            .named("vpn1")
            .with_flags(SaFlags::STAYALIVE);
        let id = d.create_sa(ctx, LINK).unwrap();
        d.set_lifetime(id, 10, 0).unwrap();
        d.setup_expirations(id).unwrap();

        // The rekey started at soft expiry never completes.
        clock.advance_to(secs(9));
        assert_eq!(d.run_due(), 1);
        clock.advance_to(secs(10));
        assert_eq!(d.run_due(), 1);
        let reasons: Vec<_> = d.engine().requests.iter().map(|r| r.reason).collect();
        assert_eq!(reasons, vec![EstablishReason::Rekey, EstablishReason::StayAlive]);
        assert!(d.sa(id).is_none());
    }

    #[test]
    fn rekeyed_stayalive_sa_expires_quietly() {
        let clock = VirtualClock::new(0);
        let (mut d, _) = daemon(&clock, 1);
        let old = d
            .create_sa(
                SaContext::phase2(cookies(), [0, 0, 0, 1], peer())
                    .named("vpn1")
                    .with_flags(SaFlags::STAYALIVE),
                LINK,
            )
            .unwrap();
        d.set_lifetime(old, 100, 0).unwrap();
        d.setup_expirations(old).unwrap();

        clock.advance_to(secs(90));
        d.run_due();
        assert_eq!(d.engine().requests.len(), 1);
        let new = d
            .create_sa(
                SaContext::phase2(cookies(), [0, 0, 0, 2], peer())
                    .named("vpn1")
                    .with_flags(SaFlags::STAYALIVE),
                LINK,
            )
            .unwrap();
        d.sa_ready(new).unwrap();
        assert!(d.sa(old).unwrap().flags.contains(SaFlags::REPLACED));

        clock.advance_to(secs(100));
        d.run_due();
        assert_eq!(d.engine().requests.len(), 1);
        assert_eq!(d.engine().requests[0].reason, EstablishReason::Rekey);
        assert!(d.sa(old).is_none());
        assert!(d.sa(new).is_some());
    }

    #[test]
    fn kernel_notices_follow_expiry_logic() {
        let clock = VirtualClock::new(0);
        let (mut d, _) = daemon(&clock, 1);
        let ctx = SaContext::phase2(cookies(), [0, 0, 0, 1], peer())
            .named("vpn1")
            .with_proto(Proto::new(ProtoId::Esp, 0x1111, 0x2222, 3));
        let id = d.create_sa(ctx, LINK).unwrap();

        let notice = KernelNotice {
            dst: peer().ip(),
            spi: 0x2222,
            protocol: ProtoId::Esp,
            hard: false,
        };
        d.kernel_expiration(notice).unwrap();
        assert_eq!(d.time_until_next(), Some(Duration::ZERO));
        d.run_due();
        assert_eq!(d.engine().requests[0].reason, EstablishReason::KernelExpiry);

        d.kernel_expiration(KernelNotice {
            hard: true,
            ..notice
        })
        .unwrap();
        d.run_due();
        assert!(d.sa(id).is_none());

        // Unknown SPI: nothing happens.
        d.kernel_expiration(notice).unwrap();
        assert_eq!(d.run_due(), 1);
        assert_eq!(d.engine().requests.len(), 1);
    }

    #[test]
    fn dpd_probe_and_ack_round_trip() {
        let clock = VirtualClock::new(0);
        let (mut a, a_out) = daemon(&clock, 1);
        let (mut b, b_out) = daemon(&clock, 2);
        let sa_a = dpd_pair(&mut a);
        let sa_b = dpd_pair(&mut b);
        assert_eq!(a.sa(sa_a).unwrap().dpd_deadline(), Some(secs(300)));

        clock.advance_to(secs(300));
        a.run_due();
        assert_eq!(a.engine().timeouts, vec![sa_a]);
        assert_eq!(a.flush_transports(), 1);
        let probe = take(&a_out).remove(0);
        let (_, notify) = DpdNotify::from_datagram(&probe).unwrap();
        assert_eq!(notify.seq, a.sa(sa_a).unwrap().dpd_seq);
        assert_eq!(notify.seq & 0x8000_0000, 0);

        b.handle_dpd(&probe).unwrap();
        assert_eq!(b.sa(sa_b).unwrap().dpd_rseq, notify.seq);
        assert_eq!(b.flush_transports(), 1);
        let ack = take(&b_out).remove(0);

        a.handle_dpd(&ack).unwrap();
        assert_eq!(a.sa(sa_a).unwrap().dpd_deadline(), Some(secs(600)));
        // One reference for the registry, one for the pending worry timer.
        assert_eq!(a.sa(sa_a).unwrap().refcnt(), 2);
        assert_eq!(b.sa(sa_b).unwrap().refcnt(), 2);
        assert_eq!(a.metrics().dpd_acks_accepted.get(), 1);
    }

    #[traced_test]
    #[test]
    fn replayed_probe_is_dropped_and_logged() {
        let clock = VirtualClock::new(0);
        let (mut a, a_out) = daemon(&clock, 1);
        let (mut b, _) = daemon(&clock, 2);
        let sa_a = dpd_pair(&mut a);
        let sa_b = dpd_pair(&mut b);

        a.send_dpd_probe(sa_a).unwrap();
        a.flush_transports();
        let probe = take(&a_out).remove(0);
        b.handle_dpd(&probe).unwrap();

        let err = b.handle_dpd(&probe).unwrap_err();
        assert!(matches!(
            err,
            DaemonError::Protocol(ProtocolViolation::PayloadMalformed(_))
        ));
        assert!(b.sa(sa_b).is_some());
        assert_eq!(b.metrics().dpd_rejected.get(), 1);
        assert!(logs_contain("dpd_violation"));
    }

    #[test]
    fn unsolicited_ack_rejected() {
        let clock = VirtualClock::new(0);
        let (mut a, _) = daemon(&clock, 1);
        dpd_pair(&mut a);
        let ack = DpdNotify::new(ikewarden_protocols::DpdKind::RUThereAck, cookies(), 0)
            .to_datagram([0; 4]);
        assert!(matches!(
            a.handle_dpd(&ack),
            Err(DaemonError::Protocol(ProtocolViolation::PayloadMalformed(_)))
        ));
    }

    #[test]
    fn notify_outside_informational_exchange_rejected() {
        let clock = VirtualClock::new(0);
        let (mut a, _) = daemon(&clock, 1);
        let sa_a = dpd_pair(&mut a);
        let mut probe = DpdNotify::new(ikewarden_protocols::DpdKind::RUThere, cookies(), 9)
            .to_datagram([0; 4])
            .to_vec();
        // Exchange type byte of the header: Identity Protection.
        probe[18] = 2;
        assert!(matches!(
            a.handle_dpd(&probe),
            Err(DaemonError::Protocol(ProtocolViolation::InvalidExchangeType(_)))
        ));
        assert_eq!(a.sa(sa_a).unwrap().dpd_rseq, 0);
        assert_eq!(a.metrics().dpd_rejected.get(), 1);
    }

    #[test]
    fn unknown_cookies_are_not_a_violation() {
        let clock = VirtualClock::new(0);
        let (mut a, _) = daemon(&clock, 1);
        let probe = DpdNotify::new(
            ikewarden_protocols::DpdKind::RUThere,
            Cookies::new([7; 8], [8; 8]),
            1,
        )
        .to_datagram([0; 4]);
        assert!(matches!(a.handle_dpd(&probe), Err(DaemonError::NoSa(_))));
        assert_eq!(a.metrics().dpd_rejected.get(), 0);
    }

    #[traced_test]
    #[test]
    fn dead_peer_verdict_stops_probing() {
        let clock = VirtualClock::new(0);
        let (mut a, a_out) = daemon(&clock, 1);
        let id = dpd_pair(&mut a);
        a.engine_mut().dead = true;

        clock.advance_to(secs(300));
        a.run_due();
        assert_eq!(a.flush_transports(), 0);
        assert!(take(&a_out).is_empty());
        assert_eq!(a.sa(id).unwrap().refcnt(), 1);
        assert!(logs_contain("dpd_peer_dead"));

        a.delete_sa(id);
        assert!(a.sa(id).is_none());
    }

    #[test]
    fn deleting_sa_cancels_worry_timer() {
        let clock = VirtualClock::new(0);
        let (mut a, _) = daemon(&clock, 1);
        let id = dpd_pair(&mut a);
        assert_eq!(a.scheduler().len(), 1);
        a.delete_sa(id);
        assert!(a.sa(id).is_none());
        assert!(a.scheduler().is_empty());
    }

    #[test]
    fn unanswered_probes_escalate_each_interval() {
        let clock = VirtualClock::new(0);
        let (mut a, a_out) = daemon(&clock, 1);
        let id = dpd_pair(&mut a);

        for round in 1..=3u64 {
            clock.advance_to(secs(300 * round));
            a.run_due();
            a.flush_transports();
        }
        let seqs: Vec<u32> = take(&a_out)
            .iter()
            .map(|d| DpdNotify::from_datagram(d).unwrap().1.seq)
            .collect();
        assert_eq!(seqs.len(), 3);
        assert!(seqs.windows(2).all(|w| w[1] == w[0] + 1));
        assert_eq!(a.engine().timeouts, vec![id, id, id]);
        assert_eq!(a.sa(id).unwrap().refcnt(), 2);
    }

    #[test]
    fn connection_checks_every_interval_via_run_due() {
        let clock = VirtualClock::new(0);
        let (mut d, _) = daemon(&clock, 1);
        d.setup_connection("vpn1").unwrap();
        d.run_due();
        assert_eq!(d.engine().requests.len(), 1);
        assert_eq!(
            d.connections().get("vpn1").unwrap().next_check(),
            Some(secs(60))
        );
        clock.advance_to(secs(60));
        d.run_due();
        assert_eq!(
            d.connections().get("vpn1").unwrap().next_check(),
            Some(secs(120))
        );
        assert!(d.teardown_connection("vpn1"));
        assert!(d.scheduler().is_empty());
    }

    #[test]
    fn configured_connections_registered_once() {
        let clock = VirtualClock::new(0);
        let (mut d, _) = daemon(&clock, 1);
        d.setup_connection("vpn2").unwrap();
        let config = ConnectionsConfig {
            phase2: vec!["vpn1".into(), "vpn2".into(), "vpn1".into(), "vpn3".into()],
        };
        assert_eq!(d.setup_configured_connections(&config).unwrap(), 2);
        let names: Vec<_> = d.connections().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["vpn1", "vpn2", "vpn3"]);

        assert_eq!(d.run_due(), 3);
        assert!(d
            .engine()
            .requests
            .iter()
            .all(|r| r.reason == EstablishReason::Connection && r.phase == Phase::Two));
        assert_eq!(d.engine().requests.len(), 3);
    }

    #[test]
    fn unknown_transport_rejected() {
        let clock = VirtualClock::new(0);
        let (mut d, _) = daemon(&clock, 1);
        let err = d
            .create_sa(SaContext::phase1(cookies(), peer()), TransportId(9))
            .unwrap_err();
        assert!(matches!(err, DaemonError::UnknownTransport(TransportId(9))));
        assert!(matches!(
            d.on_writable(TransportId(9)),
            Err(DaemonError::UnknownTransport(_))
        ));
    }

    #[test]
    fn report_lists_sas_and_connections() {
        let clock = VirtualClock::new(0);
        let (mut d, _) = daemon(&clock, 1);
        dpd_pair(&mut d);
        d.setup_connection("vpn1").unwrap();
        let lines = d.report();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("sa#1 phase 1 name peer"));
        assert!(lines[0].contains("ready,dpd-capable,dpd-active"));
        assert!(lines[0].contains("dpd 300.000s"));
        assert_eq!(lines[1], "connection vpn1 registered next check 0.000s");
    }

    #[test]
    fn capacities_come_from_settings() {
        let clock = VirtualClock::new(0);
        let settings = Settings::defaults().with("general", "max_sas", 1);
        let mut d = Daemon::new(MockEngine::default(), clock, settings, MetricsRecorder::new(), 1)
            .unwrap();
        d.add_transport(Box::new(Pipe {
            id: LINK,
            out: Rc::default(),
        }))
        .unwrap();
        d.create_sa(SaContext::phase1(cookies(), peer()), LINK).unwrap();
        let err = d
            .create_sa(SaContext::phase1(Cookies::new([1; 8], [1; 8]), peer()), LINK)
            .unwrap_err();
        assert!(err.is_allocation());
    }
}
