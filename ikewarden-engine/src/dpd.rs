//! ## ikewarden-engine::dpd
//! **Dead Peer Detection**
//!
//! Probe state lives on the SA (`dpd_seq`, `dpd_rseq`, the worry timer); this
//! module holds the validation rules and the per-exchange vendor marker
//! bookkeeping. Each worry timer holds one SA reference. Replacing a timer
//! arms the new one before cancelling the old, so the count never dips.
//!
//! Validation drops a notify on the first failed rule:
//! - `recv_ack`: type is R-U-THERE-ACK, cookies match, sequence echoes ours
//! - `recv_notify`: phase 1 and R-U-THERE, cookies match, sequence is fresh

use std::collections::HashSet;
use std::fmt;

use bytes::Bytes;
use opentelemetry::KeyValue;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, warn};

use ikewarden_core::{Scheduler, Timestamp};
use ikewarden_protocols::header::PAYLOAD_NONE;
use ikewarden_protocols::{
    is_dpd_vendor_id, vendor_id_payload, DpdKind, DpdNotify, NotifyPayload, NOTIFY_R_U_THERE,
    NOTIFY_R_U_THERE_ACK,
};
use ikewarden_telemetry::{EventLogger, MetricsRecorder};

use crate::error::{ProtocolViolation, Result};
use crate::registry::SaRegistry;
use crate::retransmit::ExchangeId;
use crate::sa::{Phase, SaFlags, SaId, SecurityAssociation};
use crate::timer::TimerKind;

/// Largest first sequence number; the top bit stays clear.
const INITIAL_SEQ_MAX: u32 = 0x7FFF_FFFF;

pub struct DpdEngine {
    rng: SmallRng,
    marker_sent: HashSet<ExchangeId>,
    marker_checked: HashSet<ExchangeId>,
    metrics: MetricsRecorder,
}

impl DpdEngine {
    pub fn new(seed: u64, metrics: MetricsRecorder) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
            marker_sent: HashSet::new(),
            marker_checked: HashSet::new(),
            metrics,
        }
    }

    /// Vendor ID payload to attach to the exchange's outgoing traffic, the
    /// first time only.
    pub fn vendor_marker(&mut self, exchange: ExchangeId) -> Option<Bytes> {
        self.marker_sent
            .insert(exchange)
            .then(|| vendor_id_payload(PAYLOAD_NONE))
    }

    /// Looks for the DPD vendor ID among `vendor_ids` and flags the SA as
    /// DPD-capable. Runs at most once per exchange.
    pub fn check_vendor_marker(
        &mut self,
        exchange: ExchangeId,
        sa: &mut SecurityAssociation,
        vendor_ids: &[&[u8]],
    ) -> bool {
        if !self.marker_checked.insert(exchange) {
            return sa.flags.contains(SaFlags::DPD_CAPABLE);
        }
        if vendor_ids.iter().any(|v| is_dpd_vendor_id(v)) {
            debug!("dpd_check_vendor: {} peer is DPD-capable", sa.id);
            sa.flags.insert(SaFlags::DPD_CAPABLE);
            return true;
        }
        false
    }

    pub fn forget_exchange(&mut self, exchange: ExchangeId) {
        self.marker_sent.remove(&exchange);
        self.marker_checked.remove(&exchange);
    }

    /// Builds the next R-U-THERE for `sa`, advancing its sequence.
    pub fn send_notify(&mut self, sa: &mut SecurityAssociation) -> DpdNotify {
        sa.dpd_seq = if sa.dpd_seq == 0 {
            self.rng.random_range(1..=INITIAL_SEQ_MAX)
        } else {
            // The first sequence is below 2^31, so a wrap needs at least
            // 2^31 probes on one SA; the SA is rekeyed long before that.
            sa.dpd_seq.wrapping_add(1).max(1)
        };
        debug!("dpd_send_notify: {} seq {}", sa.id, sa.dpd_seq);
        self.metrics.dpd_probes_sent.inc();
        DpdNotify::new(DpdKind::RUThere, sa.cookies, sa.dpd_seq)
    }

    /// Checks an R-U-THERE-ACK against the last probe sent.
    pub fn recv_ack(
        &self,
        sa: &SecurityAssociation,
        payload: &NotifyPayload<'_>,
    ) -> std::result::Result<u32, ProtocolViolation> {
        if payload.notify_type != NOTIFY_R_U_THERE_ACK {
            return Err(ProtocolViolation::PayloadMalformed(format!(
                "notify type {} is not R-U-THERE-ACK",
                payload.notify_type
            )));
        }
        let notify = DpdNotify::try_from(payload)?;
        if notify.cookies != sa.cookies {
            return Err(ProtocolViolation::InvalidSpi);
        }
        if sa.dpd_seq == 0 || notify.seq != sa.dpd_seq {
            warn!(
                "dpd_handle_notify: {} bad R-U-THERE-ACK seq, expected {} got {}",
                sa.id, sa.dpd_seq, notify.seq
            );
            return Err(ProtocolViolation::PayloadMalformed(format!(
                "ack seq {} does not echo {}",
                notify.seq, sa.dpd_seq
            )));
        }
        self.metrics.dpd_acks_accepted.inc();
        Ok(notify.seq)
    }

    /// Checks an incoming R-U-THERE and records its sequence.
    pub fn recv_notify(
        &self,
        sa: &mut SecurityAssociation,
        payload: &NotifyPayload<'_>,
    ) -> std::result::Result<u32, ProtocolViolation> {
        if sa.phase != Phase::One {
            return Err(ProtocolViolation::InvalidExchangeType(format!(
                "phase {}",
                sa.phase.number()
            )));
        }
        if payload.notify_type != NOTIFY_R_U_THERE {
            return Err(ProtocolViolation::PayloadMalformed(format!(
                "notify type {} is not R-U-THERE",
                payload.notify_type
            )));
        }
        let notify = DpdNotify::try_from(payload)?;
        if notify.cookies != sa.cookies {
            return Err(ProtocolViolation::InvalidSpi);
        }
        if notify.seq <= sa.dpd_rseq {
            return Err(ProtocolViolation::PayloadMalformed(format!(
                "R-U-THERE seq {} not above {}",
                notify.seq, sa.dpd_rseq
            )));
        }
        sa.dpd_rseq = notify.seq;
        debug!("dpd_handle_notify: {} accepted R-U-THERE seq {}", sa.id, notify.seq);
        Ok(notify.seq)
    }

    /// Echoes the last accepted sequence.
    pub fn send_ack(&self, sa: &SecurityAssociation) -> DpdNotify {
        DpdNotify::new(DpdKind::RUThereAck, sa.cookies, sa.dpd_rseq)
    }

    /// Fresh random message id for an informational exchange.
    pub fn message_id(&mut self) -> [u8; 4] {
        self.rng.random::<u32>().to_be_bytes()
    }

    /// Logs a dropped notify as a security event.
    pub fn report_violation(&self, subject: impl fmt::Display, violation: &ProtocolViolation) {
        warn!("dpd: dropping notify for {subject}: {violation}");
        self.metrics.dpd_rejected.inc();
        EventLogger::log_event(
            "dpd_violation",
            vec![
                KeyValue::new("subject", subject.to_string()),
                KeyValue::new("violation", violation.to_string()),
            ],
        );
    }
}

/// Arms a worry timer for `id` at `deadline`, replacing any pending one.
pub(crate) fn reset_worry_timer(
    registry: &mut SaRegistry,
    scheduler: &mut Scheduler<TimerKind>,
    id: SaId,
    deadline: Timestamp,
) -> Result<()> {
    let handle = registry.arm(id, scheduler, "dpd_check", TimerKind::DpdCheck(id), deadline)?;
    let previous = match registry.get_mut(id) {
        Some(sa) => sa.dpd_timer.replace(handle),
        None => None,
    };
    if let Some(previous) = previous {
        if scheduler.cancel(previous).is_some() {
            registry.release(id, scheduler);
        }
    }
    debug!("dpd_timer_reset: {id} next check at {deadline}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sa::SaContext;
    use crate::transport::TransportId;
    use bytes::BytesMut;
    use ikewarden_protocols::Cookies;

    fn sa() -> SecurityAssociation {
        let ctx = SaContext::phase1(
            Cookies::new([1; 8], [2; 8]),
            "198.51.100.1:500".parse().unwrap(),
        );
        SecurityAssociation::new(SaId(1), ctx, TransportId(0))
    }

    fn encode(notify: DpdNotify) -> BytesMut {
        let mut buf = BytesMut::new();
        notify.encode_payload(0, &mut buf);
        buf
    }

    fn engine() -> DpdEngine {
        DpdEngine::new(7, MetricsRecorder::new())
    }

    #[test]
    fn first_sequence_has_top_bit_clear() {
        for seed in 0..64 {
            let mut dpd = DpdEngine::new(seed, MetricsRecorder::new());
            let mut sa = sa();
            let first = dpd.send_notify(&mut sa).seq;
            assert!(first != 0 && first & 0x8000_0000 == 0);
        }
    }

    #[test]
    fn sequences_never_repeat() {
        let mut dpd = engine();
        let mut sa = sa();
        let seqs: Vec<u32> = (0..100).map(|_| dpd.send_notify(&mut sa).seq).collect();
        assert!(seqs.windows(2).all(|w| w[1] == w[0] + 1));
    }

    #[test]
    fn sequence_space_leaves_room_before_wrapping() {
        let mut dpd = engine();
        let mut sa = sa();
        let first = dpd.send_notify(&mut sa).seq;
        assert!(u32::MAX - first >= 1 << 31);

        sa.dpd_seq = u32::MAX;
        assert_eq!(dpd.send_notify(&mut sa).seq, 1);
    }

    #[test]
    fn ack_must_echo_last_sequence() {
        let mut dpd = engine();
        let mut sa = sa();
        let probe = dpd.send_notify(&mut sa);

        let good = encode(DpdNotify::new(DpdKind::RUThereAck, sa.cookies, probe.seq));
        let (payload, _) = NotifyPayload::parse(&good).unwrap();
        assert_eq!(dpd.recv_ack(&sa, &payload), Ok(probe.seq));

        let stale = encode(DpdNotify::new(DpdKind::RUThereAck, sa.cookies, probe.seq - 1));
        let (payload, _) = NotifyPayload::parse(&stale).unwrap();
        assert!(matches!(
            dpd.recv_ack(&sa, &payload),
            Err(ProtocolViolation::PayloadMalformed(_))
        ));
    }

    #[test]
    fn ack_validation_order() {
        let mut dpd = engine();
        let mut sa = sa();
        let probe = dpd.send_notify(&mut sa);

        // A probe where an ack is expected fails on type before anything else.
        let wrong_type = encode(DpdNotify::new(
            DpdKind::RUThere,
            Cookies::new([9; 8], [9; 8]),
            probe.seq,
        ));
        let (payload, _) = NotifyPayload::parse(&wrong_type).unwrap();
        assert!(matches!(
            dpd.recv_ack(&sa, &payload),
            Err(ProtocolViolation::PayloadMalformed(_))
        ));

        let spoofed = encode(DpdNotify::new(
            DpdKind::RUThereAck,
            Cookies::new([9; 8], [9; 8]),
            probe.seq,
        ));
        let (payload, _) = NotifyPayload::parse(&spoofed).unwrap();
        assert_eq!(dpd.recv_ack(&sa, &payload), Err(ProtocolViolation::InvalidSpi));
    }

    #[test]
    fn responder_rejects_replays() {
        let dpd = engine();
        let mut sa = sa();
        let start = 1000u32;
        for seq in start..start + 5 {
            let buf = encode(DpdNotify::new(DpdKind::RUThere, sa.cookies, seq));
            let (payload, _) = NotifyPayload::parse(&buf).unwrap();
            assert_eq!(dpd.recv_notify(&mut sa, &payload), Ok(seq));
        }
        for seq in [start, start + 4] {
            let buf = encode(DpdNotify::new(DpdKind::RUThere, sa.cookies, seq));
            let (payload, _) = NotifyPayload::parse(&buf).unwrap();
            assert!(matches!(
                dpd.recv_notify(&mut sa, &payload),
                Err(ProtocolViolation::PayloadMalformed(_))
            ));
        }
        assert_eq!(sa.dpd_rseq, start + 4);
        assert_eq!(dpd.send_ack(&sa).seq, start + 4);
    }

    #[test]
    fn responder_rejects_phase2_and_spoofed_cookies() {
        let dpd = engine();
        let mut sa = sa();
        let spoofed = encode(DpdNotify::new(
            DpdKind::RUThere,
            Cookies::new([3; 8], [4; 8]),
            5,
        ));
        let (payload, _) = NotifyPayload::parse(&spoofed).unwrap();
        assert_eq!(dpd.recv_notify(&mut sa, &payload), Err(ProtocolViolation::InvalidSpi));
        assert_eq!(sa.dpd_rseq, 0);

        sa.phase = Phase::Two;
        let good = encode(DpdNotify::new(DpdKind::RUThere, sa.cookies, 5));
        let (payload, _) = NotifyPayload::parse(&good).unwrap();
        assert_eq!(
            dpd.recv_notify(&mut sa, &payload),
            Err(ProtocolViolation::InvalidExchangeType("phase 2".into()))
        );
    }

    #[test]
    fn vendor_marker_once_per_exchange() {
        let mut dpd = engine();
        let mut sa = sa();
        let x = ExchangeId(1);

        let marker = dpd.vendor_marker(x).unwrap();
        assert!(dpd.vendor_marker(x).is_none());

        let body = &marker[4..];
        assert!(!dpd.check_vendor_marker(ExchangeId(2), &mut sa, &[&b"other vendor"[..]]));
        // Already checked for exchange 2; a later marker is not looked at.
        assert!(!dpd.check_vendor_marker(ExchangeId(2), &mut sa, &[body]));
        assert!(dpd.check_vendor_marker(x, &mut sa, &[body]));
        assert!(sa.flags.contains(SaFlags::DPD_CAPABLE));
    }

    #[test]
    fn worry_timer_replacement_keeps_references_balanced() {
        let mut registry = SaRegistry::new(4, MetricsRecorder::new());
        let mut scheduler = Scheduler::with_capacity(8).unwrap();
        let ctx = SaContext::phase1(
            Cookies::new([1; 8], [2; 8]),
            "198.51.100.1:500".parse().unwrap(),
        );
        let id = registry.create(ctx, TransportId(0)).unwrap();

        reset_worry_timer(&mut registry, &mut scheduler, id, Timestamp::from_secs(300)).unwrap();
        assert_eq!(registry.get(id).unwrap().refcnt(), 2);
        reset_worry_timer(&mut registry, &mut scheduler, id, Timestamp::from_secs(400)).unwrap();
        assert_eq!(registry.get(id).unwrap().refcnt(), 2);
        assert_eq!(scheduler.len(), 1);
        assert_eq!(
            registry.get(id).unwrap().dpd_deadline(),
            Some(Timestamp::from_secs(400))
        );
    }
}
