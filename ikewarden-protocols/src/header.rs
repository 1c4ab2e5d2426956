//! ## ikewarden-protocols::header
//! ISAKMP fixed header and the cookie pair that names a phase-1 SA.
//!
//! ```text
//!  0               8              16       17    18    19     20        24       28
//! | initiator cookie | responder cookie | next | ver | exch | flags | msg id | length |
//! ```

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const COOKIE_LEN: usize = 8;
pub const HEADER_LEN: usize = 28;
/// Major version 1, minor version 0.
pub const VERSION_1_0: u8 = 0x10;

pub const PAYLOAD_NONE: u8 = 0;
pub const PAYLOAD_NOTIFY: u8 = 11;
pub const PAYLOAD_VENDOR: u8 = 13;

pub const FLAG_ENCRYPTION: u8 = 0x01;
pub const FLAG_COMMIT: u8 = 0x02;

/// Exchange types that matter to the liveness layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeType {
    IdentityProtection,
    Aggressive,
    Informational,
    QuickMode,
    Other(u8),
}

impl From<u8> for ExchangeType {
    fn from(value: u8) -> Self {
        match value {
            2 => ExchangeType::IdentityProtection,
            4 => ExchangeType::Aggressive,
            5 => ExchangeType::Informational,
            32 => ExchangeType::QuickMode,
            other => ExchangeType::Other(other),
        }
    }
}

impl From<ExchangeType> for u8 {
    fn from(value: ExchangeType) -> Self {
        match value {
            ExchangeType::IdentityProtection => 2,
            ExchangeType::Aggressive => 4,
            ExchangeType::Informational => 5,
            ExchangeType::QuickMode => 32,
            ExchangeType::Other(other) => other,
        }
    }
}

/// The initiator/responder cookie pair.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Cookies {
    pub initiator: [u8; COOKIE_LEN],
    pub responder: [u8; COOKIE_LEN],
}

impl Cookies {
    pub const fn new(initiator: [u8; COOKIE_LEN], responder: [u8; COOKIE_LEN]) -> Self {
        Self {
            initiator,
            responder,
        }
    }

    /// Responder cookie not yet assigned, i.e. phase 1 still negotiating.
    pub fn responder_unset(&self) -> bool {
        self.responder == [0; COOKIE_LEN]
    }

    pub fn to_bytes(&self) -> [u8; 2 * COOKIE_LEN] {
        let mut out = [0u8; 2 * COOKIE_LEN];
        out[..COOKIE_LEN].copy_from_slice(&self.initiator);
        out[COOKIE_LEN..].copy_from_slice(&self.responder);
        out
    }

    /// Splits a 16-byte SPI field back into cookies.
    pub fn from_slice(spi: &[u8]) -> Option<Self> {
        if spi.len() != 2 * COOKIE_LEN {
            return None;
        }
        let mut cookies = Cookies::default();
        cookies.initiator.copy_from_slice(&spi[..COOKIE_LEN]);
        cookies.responder.copy_from_slice(&spi[COOKIE_LEN..]);
        Some(cookies)
    }
}

impl fmt::Debug for Cookies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for Cookies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}",
            hex::encode(self.initiator),
            hex::encode(self.responder)
        )
    }
}

#[derive(Clone, Debug, PartialEq, Error)]
pub enum HeaderParseError {
    #[error("Insufficient data for ISAKMP header ({0} bytes)")]
    InsufficientData(usize),
    #[error("Unsupported ISAKMP version {0:#04x}")]
    UnsupportedVersion(u8),
    #[error("Declared length {declared} does not match datagram length {actual}")]
    LengthMismatch { declared: u32, actual: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsakmpHeader {
    pub cookies: Cookies,
    pub next_payload: u8,
    pub exchange_type: ExchangeType,
    pub flags: u8,
    pub message_id: [u8; 4],
    pub length: u32,
}

impl IsakmpHeader {
    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.cookies.initiator);
        buf.put_slice(&self.cookies.responder);
        buf.put_u8(self.next_payload);
        buf.put_u8(VERSION_1_0);
        buf.put_u8(self.exchange_type.into());
        buf.put_u8(self.flags);
        buf.put_slice(&self.message_id);
        buf.put_u32(self.length);
    }

    /// Parses the header and checks the declared length against `data`.
    pub fn parse(data: &[u8]) -> Result<Self, HeaderParseError> {
        if data.len() < HEADER_LEN {
            return Err(HeaderParseError::InsufficientData(data.len()));
        }
        let mut buf = &data[..HEADER_LEN];
        let mut cookies = Cookies::default();
        buf.copy_to_slice(&mut cookies.initiator);
        buf.copy_to_slice(&mut cookies.responder);
        let next_payload = buf.get_u8();
        let version = buf.get_u8();
        if version >> 4 != VERSION_1_0 >> 4 {
            return Err(HeaderParseError::UnsupportedVersion(version));
        }
        let exchange_type = ExchangeType::from(buf.get_u8());
        let flags = buf.get_u8();
        let mut message_id = [0u8; 4];
        buf.copy_to_slice(&mut message_id);
        let length = buf.get_u32();
        if length as usize != data.len() {
            return Err(HeaderParseError::LengthMismatch {
                declared: length,
                actual: data.len(),
            });
        }
        Ok(Self {
            cookies,
            next_payload,
            exchange_type,
            flags,
            message_id,
            length,
        })
    }

    /// Frames `body` (already encoded payloads) behind a header.
    pub fn frame(
        cookies: Cookies,
        exchange_type: ExchangeType,
        first_payload: u8,
        message_id: [u8; 4],
        body: &[u8],
    ) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + body.len());
        let header = IsakmpHeader {
            cookies,
            next_payload: first_payload,
            exchange_type,
            flags: 0,
            message_id,
            length: (HEADER_LEN + body.len()) as u32,
        };
        header.write(&mut buf);
        buf.put_slice(body);
        buf.freeze()
    }
}
