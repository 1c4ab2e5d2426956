//! # ikewarden Protocol Codecs
//!
//! Wire formats used by the liveness core: the ISAKMP fixed header and the
//! Dead Peer Detection notify and vendor ID payloads.

pub mod dpd;
pub mod header;

pub use dpd::{
    is_dpd_vendor_id, vendor_id_payload, DpdKind, DpdNotify, NotifyParseError, NotifyPayload,
    DPD_NOTIFY_LEN, DPD_VENDOR_ID, NOTIFY_R_U_THERE, NOTIFY_R_U_THERE_ACK,
};
pub use header::{Cookies, ExchangeType, HeaderParseError, IsakmpHeader, HEADER_LEN};
