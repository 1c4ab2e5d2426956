//! ## ikewarden-engine::registry
//! **Arena of security associations with reference counting**
//!
//! The registry holds the only copy of every SA. Holders of an [`SaId`] keep
//! it alive by taking a reference:
//! - the registry itself holds one from `create` until `delete`,
//! - every pending expiry or DPD event holds one until it fires or is cancelled.
//!
//! When the count drops to zero the record is removed. A deleted SA is
//! unlinked from every index first, so lookups never return it, while
//! outstanding ids still resolve through [`SaRegistry::get`] until the last
//! reference goes.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use tracing::{debug, error, trace};

use ikewarden_core::{Scheduler, TimerHandle, Timestamp};
use ikewarden_protocols::Cookies;
use ikewarden_telemetry::MetricsRecorder;

use crate::error::{DaemonError, Result};
use crate::sa::{Phase, ProtoId, SaContext, SaFlags, SaId, SecurityAssociation};
use crate::timer::TimerKind;
use crate::transport::TransportId;

type CookieKey = (Cookies, Option<[u8; 4]>);

pub struct SaRegistry {
    sas: HashMap<SaId, SecurityAssociation>,
    by_cookies: HashMap<CookieKey, SaId>,
    by_name: HashMap<(String, Phase), Vec<SaId>>,
    next_id: u64,
    capacity: usize,
    metrics: MetricsRecorder,
}

impl SaRegistry {
    pub fn new(capacity: usize, metrics: MetricsRecorder) -> Self {
        Self {
            sas: HashMap::new(),
            by_cookies: HashMap::new(),
            by_name: HashMap::new(),
            next_id: 1,
            capacity,
            metrics,
        }
    }

    /// Allocates an SA bound to `transport`, holding the registry's own reference.
    pub fn create(&mut self, ctx: SaContext, transport: TransportId) -> Result<SaId> {
        if self.sas.len() >= self.capacity {
            error!("sa_create: table full ({} SAs)", self.sas.len());
            return Err(DaemonError::SaCapacity {
                capacity: self.capacity,
            });
        }
        let key = (ctx.cookies, ctx.message_id);
        if let Some(existing) = self.by_cookies.get(&key) {
            debug!("sa_create: cookies {} already name {existing}", ctx.cookies);
            return Err(DaemonError::Duplicate(format!("SA cookies {}", ctx.cookies)));
        }

        let id = SaId(self.next_id);
        self.next_id += 1;
        let sa = SecurityAssociation::new(id, ctx, transport);

        self.by_cookies.insert(key, id);
        if let Some(name) = &sa.name {
            self.by_name
                .entry((name.clone(), sa.phase))
                .or_default()
                .push(id);
        }
        debug!(
            "sa_create: {id} phase {} {} on {transport}",
            sa.phase, sa.cookies
        );
        self.sas.insert(id, sa);
        self.metrics.sa_created.inc();
        self.metrics.sa_live.inc();
        Ok(id)
    }

    pub fn get(&self, id: SaId) -> Option<&SecurityAssociation> {
        self.sas.get(&id)
    }

    pub fn get_mut(&mut self, id: SaId) -> Option<&mut SecurityAssociation> {
        self.sas.get_mut(&id)
    }

    /// Reachable through the indexes, i.e. not yet deleted.
    pub fn is_live(&self, id: SaId) -> bool {
        self.sas.get(&id).is_some_and(|sa| sa.linked)
    }

    /// Phase-1 lookup. An all-zero responder cookie matches an SA that is
    /// still negotiating with the same initiator cookie.
    pub fn lookup_by_cookies(&self, initiator: [u8; 8], responder: [u8; 8]) -> Option<SaId> {
        let cookies = Cookies::new(initiator, responder);
        if cookies.responder_unset() {
            return self
                .sas
                .values()
                .filter(|sa| sa.linked && sa.phase == Phase::One)
                .find(|sa| sa.cookies.initiator == initiator)
                .map(|sa| sa.id);
        }
        self.by_cookies.get(&(cookies, None)).copied()
    }

    /// Phase-2 lookup by the phase-1 cookies and the exchange message id.
    pub fn lookup_by_message(&self, cookies: Cookies, message_id: [u8; 4]) -> Option<SaId> {
        self.by_cookies.get(&(cookies, Some(message_id))).copied()
    }

    /// The newest SA for `name` in `phase` that has not been replaced.
    pub fn lookup_by_name(&self, name: &str, phase: Phase) -> Option<SaId> {
        self.by_name
            .get(&(name.to_owned(), phase))?
            .iter()
            .rev()
            .copied()
            .find(|id| {
                self.sas
                    .get(id)
                    .is_some_and(|sa| !sa.flags.contains(SaFlags::REPLACED))
            })
    }

    /// Finds the SA a kernel notice refers to.
    pub fn lookup(&self, dst: IpAddr, spi: &[u8], protocol: ProtoId) -> Option<SaId> {
        self.sas
            .values()
            .filter(|sa| sa.linked && sa.peer.ip() == dst)
            .find(|sa| {
                sa.protos
                    .iter()
                    .any(|p| p.proto == protocol && p.has_spi(spi))
            })
            .map(|sa| sa.id)
    }

    /// Records the responder cookie once phase 1 learns it.
    pub fn set_responder_cookie(&mut self, id: SaId, responder: [u8; 8]) -> Result<()> {
        let sa = self.sas.get_mut(&id).ok_or(DaemonError::UnknownSa(id))?;
        let old_key = (sa.cookies, sa.message_id);
        let mut cookies = sa.cookies;
        cookies.responder = responder;
        let new_key = (cookies, sa.message_id);
        if self.by_cookies.contains_key(&new_key) {
            return Err(DaemonError::Duplicate(format!("SA cookies {cookies}")));
        }
        sa.cookies = cookies;
        if sa.linked {
            self.by_cookies.remove(&old_key);
            self.by_cookies.insert(new_key, id);
        }
        Ok(())
    }

    pub fn reference(&mut self, id: SaId) -> Result<()> {
        let sa = self.sas.get_mut(&id).ok_or(DaemonError::UnknownSa(id))?;
        sa.refcnt += 1;
        trace!("sa_reference: {id} refcnt {}", sa.refcnt);
        Ok(())
    }

    /// Drops one reference. Returns `true` if that destroyed the SA.
    pub fn release(&mut self, id: SaId, scheduler: &mut Scheduler<TimerKind>) -> bool {
        let Some(sa) = self.sas.get_mut(&id) else {
            debug!("sa_release: {id} already gone");
            return false;
        };
        sa.refcnt = sa.refcnt.saturating_sub(1);
        trace!("sa_release: {id} refcnt {}", sa.refcnt);
        if sa.refcnt > 0 {
            return false;
        }
        self.destroy(id, scheduler);
        true
    }

    fn destroy(&mut self, id: SaId, scheduler: &mut Scheduler<TimerKind>) {
        self.unlink(id);
        let Some(mut sa) = self.sas.remove(&id) else {
            return;
        };
        // Any handle left here belongs to an event that already fired.
        for handle in [
            sa.soft_timer.take(),
            sa.hard_timer.take(),
            sa.dpd_timer.take(),
        ]
        .into_iter()
        .flatten()
        {
            if scheduler.cancel(handle).is_some() {
                error!("sa_free: {id} destroyed with a live timer");
            }
        }
        debug!("sa_free: {id} destroyed");
        self.metrics.sa_destroyed.inc();
        self.metrics.sa_live.dec();
    }

    fn unlink(&mut self, id: SaId) {
        let Some(sa) = self.sas.get_mut(&id) else {
            return;
        };
        if !sa.linked {
            return;
        }
        sa.linked = false;
        self.by_cookies.remove(&(sa.cookies, sa.message_id));
        if let Some(name) = &sa.name {
            let key = (name.clone(), sa.phase);
            if let Some(ids) = self.by_name.get_mut(&key) {
                ids.retain(|other| *other != id);
                if ids.is_empty() {
                    self.by_name.remove(&key);
                }
            }
        }
    }

    /// Unlinks the SA, cancels its timers (dropping their references) and
    /// drops the registry's own reference. Later calls are no-ops.
    pub fn delete(&mut self, id: SaId, scheduler: &mut Scheduler<TimerKind>) {
        if !self.is_live(id) {
            return;
        }
        self.unlink(id);
        let handles = match self.sas.get_mut(&id) {
            Some(sa) => [
                sa.soft_timer.take(),
                sa.hard_timer.take(),
                sa.dpd_timer.take(),
            ],
            None => return,
        };
        for handle in handles.into_iter().flatten() {
            if scheduler.cancel(handle).is_some() {
                self.release(id, scheduler);
            }
        }
        debug!("sa_delete: {id}");
        self.release(id, scheduler);
    }

    /// Flags `id` as superseded so its own expiry does not rekey.
    pub fn mark_replaced(&mut self, id: SaId) {
        if let Some(sa) = self.sas.get_mut(&id) {
            if !sa.flags.contains(SaFlags::REPLACED) {
                debug!("sa_mark_replaced: {id}");
                sa.flags.insert(SaFlags::REPLACED);
            }
        }
    }

    /// Schedules soft expiry at 90% of `sa.seconds` and hard expiry at 100%.
    /// Each event takes one reference. An SA without a seconds budget gets none.
    pub fn setup_expirations(
        &mut self,
        id: SaId,
        scheduler: &mut Scheduler<TimerKind>,
        now: Timestamp,
    ) -> Result<()> {
        let seconds = self
            .sas
            .get(&id)
            .ok_or(DaemonError::UnknownSa(id))?
            .seconds;
        if seconds == 0 {
            return Ok(());
        }
        let lifetime = Duration::from_secs(seconds);
        // 90% without overflowing on very long lifetimes.
        let soft_after = Duration::from_secs(seconds / 10 * 9 + seconds % 10 * 9 / 10);

        let soft = self.arm(
            id,
            scheduler,
            "sa_soft_expire",
            TimerKind::SoftExpire(id),
            now + soft_after,
        )?;
        let hard = match self.arm(
            id,
            scheduler,
            "sa_hard_expire",
            TimerKind::HardExpire(id),
            now + lifetime,
        ) {
            Ok(handle) => handle,
            Err(e) => {
                if scheduler.cancel(soft).is_some() {
                    self.release(id, scheduler);
                }
                return Err(e);
            }
        };

        if let Some(sa) = self.sas.get_mut(&id) {
            for stale in [sa.soft_timer.replace(soft), sa.hard_timer.replace(hard)]
                .into_iter()
                .flatten()
            {
                if scheduler.cancel(stale).is_some() {
                    sa.refcnt = sa.refcnt.saturating_sub(1);
                }
            }
            debug!(
                "sa_setup_expirations: {id} soft {:?} hard {:?}",
                sa.soft_deadline(),
                sa.hard_deadline()
            );
        }
        Ok(())
    }

    /// Takes a reference and schedules `kind`, giving the reference back if
    /// the event cannot be queued.
    pub(crate) fn arm(
        &mut self,
        id: SaId,
        scheduler: &mut Scheduler<TimerKind>,
        name: &'static str,
        kind: TimerKind,
        deadline: Timestamp,
    ) -> Result<TimerHandle> {
        self.reference(id)?;
        match scheduler.schedule(name, kind, deadline) {
            Ok(handle) => Ok(handle),
            Err(e) => {
                self.release(id, scheduler);
                Err(e.into())
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &SecurityAssociation> {
        self.sas.values()
    }

    pub fn len(&self) -> usize {
        self.sas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sas.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sa::Proto;
    use std::net::SocketAddr;

    fn peer() -> SocketAddr {
        "192.0.2.7:500".parse().unwrap()
    }

    fn setup() -> (SaRegistry, Scheduler<TimerKind>) {
        (
            SaRegistry::new(8, MetricsRecorder::new()),
            Scheduler::with_capacity(64).unwrap(),
        )
    }

    fn phase1(i: u8, r: u8) -> SaContext {
        SaContext::phase1(Cookies::new([i; 8], [r; 8]), peer())
    }

    #[test]
    fn lookups_find_created_sa() {
        let (mut reg, _) = setup();
        let id = reg.create(phase1(1, 2).named("peer-a"), TransportId(0)).unwrap();

        assert_eq!(reg.lookup_by_cookies([1; 8], [2; 8]), Some(id));
        assert_eq!(reg.lookup_by_cookies([1; 8], [0; 8]), Some(id));
        assert_eq!(reg.lookup_by_cookies([9; 8], [2; 8]), None);
        assert_eq!(reg.lookup_by_name("peer-a", Phase::One), Some(id));
        assert_eq!(reg.lookup_by_name("peer-a", Phase::Two), None);
        assert_eq!(reg.get(id).unwrap().refcnt(), 1);
    }

    #[test]
    fn duplicate_cookies_rejected() {
        let (mut reg, _) = setup();
        reg.create(phase1(1, 2), TransportId(0)).unwrap();
        let err = reg.create(phase1(1, 2), TransportId(0)).unwrap_err();
        assert!(matches!(err, DaemonError::Duplicate(_)));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn capacity_exhaustion_is_an_allocation_error() {
        let mut reg = SaRegistry::new(1, MetricsRecorder::new());
        reg.create(phase1(1, 2), TransportId(0)).unwrap();
        let err = reg.create(phase1(3, 4), TransportId(0)).unwrap_err();
        assert!(err.is_allocation());
    }

    #[test]
    fn responder_cookie_reindexes() {
        let (mut reg, _) = setup();
        let id = reg.create(phase1(1, 0), TransportId(0)).unwrap();
        reg.set_responder_cookie(id, [5; 8]).unwrap();
        assert_eq!(reg.lookup_by_cookies([1; 8], [5; 8]), Some(id));
        assert_eq!(reg.lookup_by_cookies([1; 8], [0; 8]), Some(id));
    }

    #[test]
    fn kernel_lookup_by_spi() {
        let (mut reg, _) = setup();
        let ctx = SaContext::phase2(Cookies::new([1; 8], [2; 8]), [0, 0, 0, 1], peer())
            .with_proto(Proto::new(ProtoId::Esp, 0xdead, 0xbeef, 3));
        let id = reg.create(ctx, TransportId(0)).unwrap();

        let dst = peer().ip();
        assert_eq!(reg.lookup(dst, &0xbeefu32.to_be_bytes(), ProtoId::Esp), Some(id));
        assert_eq!(reg.lookup(dst, &0xbeefu32.to_be_bytes(), ProtoId::Ah), None);
        assert_eq!(
            reg.lookup_by_message(Cookies::new([1; 8], [2; 8]), [0, 0, 0, 1]),
            Some(id)
        );
    }

    #[test]
    fn release_destroys_at_zero() {
        let (mut reg, mut sched) = setup();
        let id = reg.create(phase1(1, 2), TransportId(0)).unwrap();
        reg.reference(id).unwrap();
        assert!(!reg.release(id, &mut sched));
        assert!(reg.release(id, &mut sched));
        assert!(reg.get(id).is_none());
        assert!(!reg.release(id, &mut sched));
    }

    #[test]
    fn delete_unlinks_before_last_reference() {
        let (mut reg, mut sched) = setup();
        let id = reg.create(phase1(1, 2).named("peer-a"), TransportId(0)).unwrap();
        reg.reference(id).unwrap();

        reg.delete(id, &mut sched);
        assert!(!reg.is_live(id));
        assert_eq!(reg.lookup_by_cookies([1; 8], [2; 8]), None);
        assert_eq!(reg.lookup_by_name("peer-a", Phase::One), None);
        assert_eq!(reg.get(id).unwrap().refcnt(), 1);

        // A second delete must not drop the outstanding holder's reference.
        reg.delete(id, &mut sched);
        assert_eq!(reg.get(id).unwrap().refcnt(), 1);
        assert!(reg.release(id, &mut sched));
    }

    #[test]
    fn replaced_sa_hidden_from_name_lookup() {
        let (mut reg, _) = setup();
        let old = reg.create(phase1(1, 2).named("vpn"), TransportId(0)).unwrap();
        let new = reg.create(phase1(3, 4).named("vpn"), TransportId(0)).unwrap();
        assert_eq!(reg.lookup_by_name("vpn", Phase::One), Some(new));

        reg.mark_replaced(new);
        reg.mark_replaced(new);
        assert_eq!(reg.lookup_by_name("vpn", Phase::One), Some(old));
        assert!(reg.get(new).unwrap().flags.contains(SaFlags::REPLACED));
    }

    #[test]
    fn expirations_take_references() {
        let (mut reg, mut sched) = setup();
        let id = reg.create(phase1(1, 2), TransportId(0)).unwrap();
        reg.get_mut(id).unwrap().seconds = 100;
        reg.setup_expirations(id, &mut sched, Timestamp::ZERO).unwrap();

        let sa = reg.get(id).unwrap();
        assert_eq!(sa.refcnt(), 3);
        assert_eq!(sa.soft_deadline(), Some(Timestamp::from_secs(90)));
        assert_eq!(sa.hard_deadline(), Some(Timestamp::from_secs(100)));
        assert_eq!(sched.len(), 2);

        // Deleting cancels both and drops every reference.
        reg.delete(id, &mut sched);
        assert!(sched.is_empty());
        assert!(reg.get(id).is_none());
    }

    #[test]
    fn huge_lifetimes_do_not_overflow() {
        let (mut reg, mut sched) = setup();
        let id = reg.create(phase1(1, 2), TransportId(0)).unwrap();
        reg.get_mut(id).unwrap().seconds = u64::MAX / 4;
        reg.setup_expirations(id, &mut sched, Timestamp::from_secs(5)).unwrap();

        let sa = reg.get(id).unwrap();
        assert_eq!(sa.refcnt(), 3);
        assert!(sa.soft_deadline().unwrap() <= sa.hard_deadline().unwrap());

        reg.get_mut(id).unwrap().seconds = 15;
        reg.setup_expirations(id, &mut sched, Timestamp::ZERO).unwrap();
        let sa = reg.get(id).unwrap();
        assert_eq!(sa.soft_deadline(), Some(Timestamp::from_secs(13)));
        assert_eq!(sa.refcnt(), 3);
        assert_eq!(sched.len(), 2);
    }

    #[test]
    fn failed_hard_expiry_rolls_back_soft() {
        let mut reg = SaRegistry::new(4, MetricsRecorder::new());
        let mut sched = Scheduler::with_capacity(1).unwrap();
        let id = reg.create(phase1(1, 2), TransportId(0)).unwrap();
        reg.get_mut(id).unwrap().seconds = 100;

        let err = reg.setup_expirations(id, &mut sched, Timestamp::ZERO).unwrap_err();
        assert!(err.is_allocation());
        assert!(sched.is_empty());
        assert_eq!(reg.get(id).unwrap().refcnt(), 1);
    }

    #[test]
    fn metrics_track_population() {
        let metrics = MetricsRecorder::new();
        let mut reg = SaRegistry::new(4, metrics.clone());
        let mut sched = Scheduler::with_capacity(4).unwrap();
        let id = reg.create(phase1(1, 2), TransportId(0)).unwrap();
        assert_eq!(metrics.sa_live.get(), 1);
        reg.delete(id, &mut sched);
        assert_eq!(metrics.sa_live.get(), 0);
        assert_eq!(metrics.sa_destroyed.get(), 1);
    }

    proptest::proptest! {
        #[test]
        fn references_balance_under_any_release_order(
            lifetimes in proptest::collection::vec(1u64..100_000, 1..8),
            delete_first in proptest::bool::ANY,
        ) {
            let (mut reg, mut sched) = setup();
            let mut ids = Vec::new();
            for (i, secs) in lifetimes.iter().enumerate() {
                let id = reg.create(phase1(i as u8 + 1, 0xee), TransportId(0)).unwrap();
                reg.get_mut(id).unwrap().seconds = *secs;
                reg.setup_expirations(id, &mut sched, Timestamp::ZERO).unwrap();
                let sa = reg.get(id).unwrap();
                proptest::prop_assert!(sa.soft_deadline() <= sa.hard_deadline());
                ids.push(id);
            }

            if delete_first {
                for id in &ids {
                    reg.delete(*id, &mut sched);
                }
            } else {
                // Fire every timer, then delete what is left.
                while let Some(event) = sched.pop_due(Timestamp::from_secs(100_000)) {
                    if let Some(id) = event.kind.sa() {
                        let sa = reg.get_mut(id).unwrap();
                        match event.kind {
                            TimerKind::SoftExpire(_) => sa.soft_timer = None,
                            _ => sa.hard_timer = None,
                        }
                        reg.release(id, &mut sched);
                    }
                }
                for id in &ids {
                    proptest::prop_assert_eq!(reg.get(*id).unwrap().refcnt(), 1);
                    reg.delete(*id, &mut sched);
                }
            }
            proptest::prop_assert!(reg.is_empty());
            proptest::prop_assert!(sched.is_empty());
        }
    }
}
