//! ## ikewarden-engine::sa
//! **Security association records**
//!
//! An SA is owned by the [`crate::registry::SaRegistry`] arena and addressed
//! by [`SaId`]. Everything else (timers, exchanges, the DPD engine) holds ids,
//! never the record itself.

use std::fmt;
use std::net::SocketAddr;
use std::ops::{BitOr, BitOrAssign};

use bytes::Bytes;

use ikewarden_core::{TimerHandle, Timestamp};
use ikewarden_protocols::{Cookies, ExchangeType};

use crate::transport::TransportId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SaId(pub u64);

impl fmt::Display for SaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sa#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    One,
    Two,
}

impl Phase {
    pub fn number(self) -> u8 {
        match self {
            Phase::One => 1,
            Phase::Two => 2,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtoId {
    Isakmp,
    Ah,
    Esp,
    IpComp,
}

/// Per-protocol record of an SA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proto {
    pub proto: ProtoId,
    pub spi_in: Bytes,
    pub spi_out: Bytes,
    pub transform_id: u8,
    pub data: Bytes,
}

impl Proto {
    pub fn new(proto: ProtoId, spi_in: u32, spi_out: u32, transform_id: u8) -> Self {
        Self {
            proto,
            spi_in: Bytes::copy_from_slice(&spi_in.to_be_bytes()),
            spi_out: Bytes::copy_from_slice(&spi_out.to_be_bytes()),
            transform_id,
            data: Bytes::new(),
        }
    }

    pub fn has_spi(&self, spi: &[u8]) -> bool {
        self.spi_in.as_ref() == spi || self.spi_out.as_ref() == spi
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SaFlags(u16);

impl SaFlags {
    pub const NONE: SaFlags = SaFlags(0);
    pub const READY: SaFlags = SaFlags(0x01);
    pub const STAYALIVE: SaFlags = SaFlags(0x02);
    pub const ONDEMAND: SaFlags = SaFlags(0x04);
    pub const REPLACED: SaFlags = SaFlags(0x08);
    pub const FADING: SaFlags = SaFlags(0x10);
    pub const ACTIVE_ONLY: SaFlags = SaFlags(0x20);
    pub const DPD_CAPABLE: SaFlags = SaFlags(0x40);
    pub const DPD_ACTIVE: SaFlags = SaFlags(0x80);

    const NAMES: [(SaFlags, &'static str); 8] = [
        (SaFlags::READY, "ready"),
        (SaFlags::STAYALIVE, "stayalive"),
        (SaFlags::ONDEMAND, "ondemand"),
        (SaFlags::REPLACED, "replaced"),
        (SaFlags::FADING, "fading"),
        (SaFlags::ACTIVE_ONLY, "active-only"),
        (SaFlags::DPD_CAPABLE, "dpd-capable"),
        (SaFlags::DPD_ACTIVE, "dpd-active"),
    ];

    pub fn contains(self, other: SaFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: SaFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: SaFlags) {
        self.0 &= !other.0;
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for SaFlags {
    type Output = SaFlags;

    fn bitor(self, rhs: SaFlags) -> SaFlags {
        SaFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for SaFlags {
    fn bitor_assign(&mut self, rhs: SaFlags) {
        self.insert(rhs);
    }
}

impl fmt::Debug for SaFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SaFlags({self})")
    }
}

impl fmt::Display for SaFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if names.is_empty() {
            f.write_str("-")
        } else {
            f.write_str(&names.join(","))
        }
    }
}

/// What the exchange engine knows when it asks for a new SA.
#[derive(Debug, Clone)]
pub struct SaContext {
    pub cookies: Cookies,
    pub message_id: Option<[u8; 4]>,
    pub name: Option<String>,
    pub phase: Phase,
    pub exchange_type: ExchangeType,
    pub peer: SocketAddr,
    pub flags: SaFlags,
    pub protos: Vec<Proto>,
}

impl SaContext {
    pub fn phase1(cookies: Cookies, peer: SocketAddr) -> Self {
        Self {
            cookies,
            message_id: None,
            name: None,
            phase: Phase::One,
            exchange_type: ExchangeType::IdentityProtection,
            peer,
            flags: SaFlags::NONE,
            protos: Vec::new(),
        }
    }

    pub fn phase2(cookies: Cookies, message_id: [u8; 4], peer: SocketAddr) -> Self {
        Self {
            cookies,
            message_id: Some(message_id),
            name: None,
            phase: Phase::Two,
            exchange_type: ExchangeType::QuickMode,
            peer,
            flags: SaFlags::NONE,
            protos: Vec::new(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_flags(mut self, flags: SaFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn with_proto(mut self, proto: Proto) -> Self {
        self.protos.push(proto);
        self
    }
}

#[derive(Debug)]
pub struct SecurityAssociation {
    pub id: SaId,
    pub cookies: Cookies,
    pub message_id: Option<[u8; 4]>,
    pub name: Option<String>,
    pub phase: Phase,
    pub exchange_type: ExchangeType,
    pub protos: Vec<Proto>,
    pub flags: SaFlags,
    pub seconds: u64,
    pub kilobytes: u64,
    pub transport: TransportId,
    pub peer: SocketAddr,
    /// Last R-U-THERE sequence sent; zero until the first probe.
    pub dpd_seq: u32,
    /// Highest R-U-THERE sequence accepted from the peer.
    pub dpd_rseq: u32,

    pub(crate) refcnt: u32,
    pub(crate) linked: bool,
    pub(crate) soft_timer: Option<TimerHandle>,
    pub(crate) hard_timer: Option<TimerHandle>,
    pub(crate) dpd_timer: Option<TimerHandle>,
}

impl SecurityAssociation {
    pub(crate) fn new(id: SaId, ctx: SaContext, transport: TransportId) -> Self {
        Self {
            id,
            cookies: ctx.cookies,
            message_id: ctx.message_id,
            name: ctx.name,
            phase: ctx.phase,
            exchange_type: ctx.exchange_type,
            protos: ctx.protos,
            flags: ctx.flags,
            seconds: 0,
            kilobytes: 0,
            transport,
            peer: ctx.peer,
            dpd_seq: 0,
            dpd_rseq: 0,
            refcnt: 1,
            linked: true,
            soft_timer: None,
            hard_timer: None,
            dpd_timer: None,
        }
    }

    pub fn refcnt(&self) -> u32 {
        self.refcnt
    }

    /// Still reachable through the registry indexes.
    pub fn is_linked(&self) -> bool {
        self.linked
    }

    pub fn soft_deadline(&self) -> Option<Timestamp> {
        self.soft_timer.as_ref().map(TimerHandle::deadline)
    }

    pub fn hard_deadline(&self) -> Option<Timestamp> {
        self.hard_timer.as_ref().map(TimerHandle::deadline)
    }

    pub fn dpd_deadline(&self) -> Option<Timestamp> {
        self.dpd_timer.as_ref().map(TimerHandle::deadline)
    }

    /// Attaches a protocol record; replaces one with the same protocol id.
    pub fn add_proto(&mut self, proto: Proto) {
        self.protos.retain(|p| p.proto != proto.proto);
        self.protos.push(proto);
    }
}
