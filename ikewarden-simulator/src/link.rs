//! Simulated datagram link between the two peers.
//!
//! Each peer's [`SimTransport`] only appends to an outbox. The simulator
//! drains the outboxes after every step, applies the network models, and
//! queues survivors on a [`Scheduler`] keyed by arrival time.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;

use ikewarden_core::{Scheduler, Timestamp};
use ikewarden_engine::{Transport, TransportId};

use crate::error::SimulationError;
use crate::network_simulation::jitter::JitterModel;
use crate::network_simulation::latency::LatencyModel;
use crate::network_simulation::packet_loss::PacketLossModel;

pub type Outbox = Rc<RefCell<VecDeque<Bytes>>>;

pub struct SimTransport {
    id: TransportId,
    outbox: Outbox,
}

impl SimTransport {
    pub fn new(id: TransportId) -> (Self, Outbox) {
        let outbox = Outbox::default();
        (
            Self {
                id,
                outbox: outbox.clone(),
            },
            outbox,
        )
    }
}

impl Transport for SimTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn send(&mut self, datagram: &[u8]) -> io::Result<()> {
        self.outbox
            .borrow_mut()
            .push_back(Bytes::copy_from_slice(datagram));
        Ok(())
    }
}

/// A datagram in flight towards peer `to`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub to: usize,
    pub datagram: Bytes,
}

pub struct Link {
    in_flight: Scheduler<Delivery>,
    latency: Box<dyn LatencyModel>,
    jitter: Box<dyn JitterModel>,
    loss: Box<dyn PacketLossModel>,
}

impl Link {
    pub fn new(
        capacity: usize,
        latency: Box<dyn LatencyModel>,
        jitter: Box<dyn JitterModel>,
        loss: Box<dyn PacketLossModel>,
    ) -> Result<Self, SimulationError> {
        Ok(Self {
            in_flight: Scheduler::with_capacity(capacity)?,
            latency,
            jitter,
            loss,
        })
    }

    /// Puts `datagram` on the wire. Returns its arrival time, or `None` if
    /// the loss model dropped it.
    pub fn transmit(
        &mut self,
        to: usize,
        datagram: Bytes,
        now: Timestamp,
    ) -> Result<Option<Timestamp>, SimulationError> {
        if self.loss.should_drop() {
            return Ok(None);
        }
        let arrival =
            self.latency.earliest_arrival(to, now) + self.jitter.apply_jitter(Duration::ZERO);
        // Delivery is never cancelled.
        let _ = self
            .in_flight
            .schedule("link_delivery", Delivery { to, datagram }, arrival)?;
        Ok(Some(arrival))
    }

    pub fn next_arrival(&self) -> Option<Timestamp> {
        self.in_flight.next_deadline()
    }

    pub fn pop_arrived(&mut self, now: Timestamp) -> Option<Delivery> {
        self.in_flight.pop_due(now).map(|event| event.kind)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}
