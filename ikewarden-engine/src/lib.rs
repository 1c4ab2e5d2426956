//! # ikewarden-engine
//!
//! Scheduling and liveness core of the key-management daemon.
//!
//! ### Key Submodules:
//! - `registry`: reference-counted SA table with its lookup indexes
//! - `retransmit`: per-transport send queues with linear backoff
//! - `dpd`: dead peer detection probes, acks and the worry timer
//! - `connection`: periodic checks that keep named connections up
//! - `daemon`: the [`Daemon`] context that owns all of the above and
//!   dispatches fired timers
//!
//! Negotiation itself is out of scope; it plugs in through [`ExchangeEngine`].

pub mod connection;
pub mod daemon;
pub mod dpd;
pub mod error;
pub mod exchange;
pub mod registry;
pub mod retransmit;
pub mod sa;
pub mod timer;
pub mod transport;

pub use connection::{Connection, ConnectionState, ConnectionSupervisor};
pub use daemon::Daemon;
pub use error::{DaemonError, ProtocolViolation, Result};
pub use exchange::{EstablishReason, EstablishRequest, ExchangeEngine, LivenessVerdict};
pub use registry::SaRegistry;
pub use retransmit::{ExchangeId, MessageId, PendingMessage, Received, Retransmitter, SendOutcome};
pub use sa::{Phase, Proto, ProtoId, SaContext, SaFlags, SaId, SecurityAssociation};
pub use timer::{KernelNotice, TimerKind};
pub use transport::{Transport, TransportId};
