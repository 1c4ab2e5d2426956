//! ## ikewarden-protocols::dpd
//! Notify payloads carrying Dead Peer Detection probes.
//!
//! A DPD notify is a fixed 32-byte payload: generic header, DOI, protocol,
//! SPI size (16), notify type, the cookie pair as SPI, and a 32-bit sequence
//! number. Parsing is zero-copy over the received datagram.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::header::{
    Cookies, ExchangeType, HeaderParseError, IsakmpHeader, COOKIE_LEN, HEADER_LEN,
    PAYLOAD_NONE, PAYLOAD_NOTIFY,
};

pub const NOTIFY_R_U_THERE: u16 = 36136;
pub const NOTIFY_R_U_THERE_ACK: u16 = 36137;

pub const DOI_IPSEC: u32 = 1;
pub const PROTO_ISAKMP: u8 = 1;

pub const GENERIC_HEADER_LEN: usize = 4;
const NOTIFY_FIXED_LEN: usize = GENERIC_HEADER_LEN + 8;
pub const DPD_SPI_LEN: usize = 2 * COOKIE_LEN;
pub const DPD_NOTIFY_LEN: usize = NOTIFY_FIXED_LEN + DPD_SPI_LEN + 4;

/// Vendor ID announcing DPD support (major 1, minor 0).
pub const DPD_VENDOR_ID: [u8; 16] = [
    0xaf, 0xca, 0xd7, 0x13, 0x68, 0xa1, 0xf1, 0xc9, 0x6b, 0x86, 0x96, 0xfc, 0x77, 0x57, 0x01, 0x00,
];
/// The trailing version bytes are not compared.
const DPD_VENDOR_PREFIX: usize = 14;

#[derive(Clone, Debug, PartialEq, Error)]
pub enum NotifyParseError {
    #[error("Insufficient data for notify payload ({0} bytes)")]
    InsufficientData(usize),
    #[error("Payload length {declared} exceeds available {available} bytes")]
    LengthMismatch { declared: usize, available: usize },
    #[error("Unexpected payload type {0}")]
    UnexpectedPayload(u8),
    #[error("Not a DPD notify type: {0}")]
    NotDpd(u16),
    #[error("Invalid SPI size {0} for DPD notify")]
    InvalidSpiSize(usize),
    #[error("Invalid sequence field size {0}")]
    InvalidSequence(usize),
    #[error("Not an informational exchange")]
    NotInformational,
    #[error(transparent)]
    Header(#[from] HeaderParseError),
}

/// A notify payload as slices into the received datagram.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct NotifyPayload<'a> {
    pub next_payload: u8,
    pub doi: u32,
    pub protocol: u8,
    pub notify_type: u16,
    pub spi: &'a [u8],
    pub data: &'a [u8],
}

impl<'a> NotifyPayload<'a> {
    /// Parses one notify payload from the start of `input`.
    ///
    /// Returns the payload and the number of bytes it occupied.
    pub fn parse(input: &'a [u8]) -> Result<(Self, usize), NotifyParseError> {
        if input.len() < NOTIFY_FIXED_LEN {
            return Err(NotifyParseError::InsufficientData(input.len()));
        }
        let mut buf = input;
        let next_payload = buf.get_u8();
        let _reserved = buf.get_u8();
        let length = buf.get_u16() as usize;
        if length < NOTIFY_FIXED_LEN || length > input.len() {
            return Err(NotifyParseError::LengthMismatch {
                declared: length,
                available: input.len(),
            });
        }
        let doi = buf.get_u32();
        let protocol = buf.get_u8();
        let spi_size = buf.get_u8() as usize;
        let notify_type = buf.get_u16();
        if NOTIFY_FIXED_LEN + spi_size > length {
            return Err(NotifyParseError::InvalidSpiSize(spi_size));
        }
        let spi = &input[NOTIFY_FIXED_LEN..NOTIFY_FIXED_LEN + spi_size];
        let data = &input[NOTIFY_FIXED_LEN + spi_size..length];
        Ok((
            Self {
                next_payload,
                doi,
                protocol,
                notify_type,
                spi,
                data,
            },
            length,
        ))
    }

    pub fn is_dpd(&self) -> bool {
        matches!(self.notify_type, NOTIFY_R_U_THERE | NOTIFY_R_U_THERE_ACK)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DpdKind {
    RUThere,
    RUThereAck,
}

impl DpdKind {
    pub fn notify_type(self) -> u16 {
        match self {
            DpdKind::RUThere => NOTIFY_R_U_THERE,
            DpdKind::RUThereAck => NOTIFY_R_U_THERE_ACK,
        }
    }
}

/// A decoded R-U-THERE or R-U-THERE-ACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DpdNotify {
    pub kind: DpdKind,
    pub cookies: Cookies,
    pub seq: u32,
}

impl DpdNotify {
    pub fn new(kind: DpdKind, cookies: Cookies, seq: u32) -> Self {
        Self { kind, cookies, seq }
    }

    pub fn encode_payload(&self, next_payload: u8, buf: &mut BytesMut) {
        buf.put_u8(next_payload);
        buf.put_u8(0);
        buf.put_u16(DPD_NOTIFY_LEN as u16);
        buf.put_u32(DOI_IPSEC);
        buf.put_u8(PROTO_ISAKMP);
        buf.put_u8(DPD_SPI_LEN as u8);
        buf.put_u16(self.kind.notify_type());
        buf.put_slice(&self.cookies.to_bytes());
        buf.put_u32(self.seq);
    }

    /// A complete informational datagram carrying this notify.
    pub fn to_datagram(&self, message_id: [u8; 4]) -> Bytes {
        let mut body = BytesMut::with_capacity(DPD_NOTIFY_LEN);
        self.encode_payload(PAYLOAD_NONE, &mut body);
        IsakmpHeader::frame(
            self.cookies,
            ExchangeType::Informational,
            PAYLOAD_NOTIFY,
            message_id,
            &body,
        )
    }

    /// Parses an informational datagram whose first payload is a DPD notify.
    pub fn from_datagram(data: &[u8]) -> Result<(IsakmpHeader, Self), NotifyParseError> {
        let header = IsakmpHeader::parse(data)?;
        if header.exchange_type != ExchangeType::Informational {
            return Err(NotifyParseError::NotInformational);
        }
        if header.next_payload != PAYLOAD_NOTIFY {
            return Err(NotifyParseError::UnexpectedPayload(header.next_payload));
        }
        let (payload, _) = NotifyPayload::parse(&data[HEADER_LEN..])?;
        Ok((header, Self::try_from(&payload)?))
    }
}

impl TryFrom<&NotifyPayload<'_>> for DpdNotify {
    type Error = NotifyParseError;

    fn try_from(payload: &NotifyPayload<'_>) -> Result<Self, Self::Error> {
        let kind = match payload.notify_type {
            NOTIFY_R_U_THERE => DpdKind::RUThere,
            NOTIFY_R_U_THERE_ACK => DpdKind::RUThereAck,
            other => return Err(NotifyParseError::NotDpd(other)),
        };
        let cookies = Cookies::from_slice(payload.spi)
            .ok_or(NotifyParseError::InvalidSpiSize(payload.spi.len()))?;
        let seq: [u8; 4] = payload
            .data
            .try_into()
            .map_err(|_| NotifyParseError::InvalidSequence(payload.data.len()))?;
        Ok(Self {
            kind,
            cookies,
            seq: u32::from_be_bytes(seq),
        })
    }
}

/// Vendor ID payload advertising DPD capability.
pub fn vendor_id_payload(next_payload: u8) -> Bytes {
    let mut buf = BytesMut::with_capacity(GENERIC_HEADER_LEN + DPD_VENDOR_ID.len());
    buf.put_u8(next_payload);
    buf.put_u8(0);
    buf.put_u16((GENERIC_HEADER_LEN + DPD_VENDOR_ID.len()) as u16);
    buf.put_slice(&DPD_VENDOR_ID);
    buf.freeze()
}

/// Whether a vendor ID payload body names DPD, ignoring the version bytes.
pub fn is_dpd_vendor_id(vendor_id: &[u8]) -> bool {
    vendor_id.len() == DPD_VENDOR_ID.len()
        && vendor_id[..DPD_VENDOR_PREFIX] == DPD_VENDOR_ID[..DPD_VENDOR_PREFIX]
}
