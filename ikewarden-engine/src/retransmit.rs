//! ## ikewarden-engine::retransmit
//! **Per-transport send queues with retry backoff**
//!
//! Messages are queued, never sent synchronously. Each `on_writable` call
//! pops one message (priority queue first), transmits it and decides what
//! happens next:
//!
//! | message   | outcome                                                      |
//! |-----------|--------------------------------------------------------------|
//! | non-final | retry after `xmits * factor + base` seconds, up to the limit |
//! | final     | kept as "last sent" once the peer has spoken, else freed     |
//!
//! Incoming packets are checked against the last one received per exchange:
//! a duplicate is dropped (replaying a retained final message), anything new
//! retires our last sent message and its retry.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use bytes::Bytes;
use opentelemetry::KeyValue;
use tracing::{debug, error, trace, warn};

use ikewarden_config::{
    ConfigLookup, DEFAULT_RETRANSMITS, DEFAULT_RETRANSMIT_BASE, DEFAULT_RETRANSMIT_FACTOR,
};
use ikewarden_core::{Scheduler, TimerHandle, Timestamp};
use ikewarden_telemetry::{EventLogger, MetricsRecorder};

use crate::exchange::ExchangeEngine;
use crate::timer::TimerKind;
use crate::transport::{Transport, TransportId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExchangeId(pub u64);

#[derive(Debug)]
pub struct PendingMessage {
    pub id: MessageId,
    pub exchange: ExchangeId,
    pub transport: TransportId,
    pub payload: Bytes,
    pub xmits: u32,
    pub is_final: bool,
    retrans: Option<TimerHandle>,
}

impl PendingMessage {
    pub fn retry_deadline(&self) -> Option<Timestamp> {
        self.retrans.as_ref().map(TimerHandle::deadline)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Sent; the retry is armed.
    Retrying {
        message: MessageId,
        deadline: Timestamp,
    },
    /// Sent, but no retry could be scheduled.
    Stalled { message: MessageId },
    /// Final message kept for replay.
    Retained { message: MessageId },
    /// Sent once and dropped.
    Freed { message: MessageId },
    /// Retry budget used up; the message is gone.
    Exhausted { message: MessageId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    New,
    Duplicate { replayed: bool },
}

#[derive(Debug, Default)]
struct ExchangeState {
    last_sent: Option<MessageId>,
    last_received: Option<Bytes>,
    received: u32,
}

#[derive(Debug, Default)]
struct SendQueues {
    priority: VecDeque<MessageId>,
    normal: VecDeque<MessageId>,
}

impl SendQueues {
    fn pop(&mut self) -> Option<MessageId> {
        self.priority.pop_front().or_else(|| self.normal.pop_front())
    }

    fn len(&self) -> usize {
        self.priority.len() + self.normal.len()
    }
}

pub struct Retransmitter {
    messages: HashMap<MessageId, PendingMessage>,
    queues: HashMap<TransportId, SendQueues>,
    exchanges: HashMap<ExchangeId, ExchangeState>,
    next_message: u64,
    next_exchange: u64,
    metrics: MetricsRecorder,
}

impl Retransmitter {
    pub fn new(metrics: MetricsRecorder) -> Self {
        Self {
            messages: HashMap::new(),
            queues: HashMap::new(),
            exchanges: HashMap::new(),
            next_message: 1,
            next_exchange: 1,
            metrics,
        }
    }

    pub fn begin_exchange(&mut self) -> ExchangeId {
        let id = ExchangeId(self.next_exchange);
        self.next_exchange += 1;
        self.exchanges.insert(id, ExchangeState::default());
        id
    }

    /// Forgets the exchange and frees its retained message.
    pub fn end_exchange(&mut self, exchange: ExchangeId, scheduler: &mut Scheduler<TimerKind>) {
        if let Some(state) = self.exchanges.remove(&exchange) {
            if let Some(last) = state.last_sent {
                self.free(last, scheduler);
            }
        }
    }

    pub fn enqueue(
        &mut self,
        transport: TransportId,
        exchange: ExchangeId,
        payload: Bytes,
        is_final: bool,
        prioritized: bool,
    ) -> MessageId {
        let id = MessageId(self.next_message);
        self.next_message += 1;
        self.exchanges.entry(exchange).or_default();
        self.messages.insert(
            id,
            PendingMessage {
                id,
                exchange,
                transport,
                payload,
                xmits: 0,
                is_final,
                retrans: None,
            },
        );
        let queues = self.queues.entry(transport).or_default();
        if prioritized {
            queues.priority.push_back(id);
        } else {
            queues.normal.push_back(id);
        }
        trace!("enqueue: {id:?} on {transport} (prioritized: {prioritized})");
        id
    }

    /// Transmits the next queued message on `transport`, if any.
    pub fn on_writable<E: ExchangeEngine + ?Sized>(
        &mut self,
        transport: &mut dyn Transport,
        scheduler: &mut Scheduler<TimerKind>,
        engine: &mut E,
        settings: &dyn ConfigLookup,
        now: Timestamp,
    ) -> Option<SendOutcome> {
        let tid = transport.id();
        let id = loop {
            let id = self.queues.get_mut(&tid)?.pop()?;
            // Freed messages leave their queue slot behind.
            if self.messages.contains_key(&id) {
                break id;
            }
        };
        let msg = self.messages.get_mut(&id)?;

        msg.xmits += 1;
        if let Err(e) = transport.send(&msg.payload) {
            warn!("on_writable: send of {id:?} on {tid} failed: {e}");
        }
        if msg.xmits > 1 {
            self.metrics.retransmits.inc();
        }
        let state = self.exchanges.entry(msg.exchange).or_default();
        let mut superseded = None;

        let outcome = if !msg.is_final {
            let limit = settings.get_num("general", "retransmits", DEFAULT_RETRANSMITS);
            if u64::from(msg.xmits) > limit {
                warn!(
                    "on_writable: giving up on {id:?} after {} transmissions",
                    msg.xmits
                );
                EventLogger::log_event(
                    "retransmission_exhausted",
                    vec![
                        KeyValue::new("message", id.0 as i64),
                        KeyValue::new("exchange", msg.exchange.0 as i64),
                        KeyValue::new("xmits", i64::from(msg.xmits)),
                    ],
                );
                self.metrics.retransmits_exhausted.inc();
                if state.last_sent == Some(id) {
                    state.last_sent = None;
                }
                SendOutcome::Exhausted { message: id }
            } else {
                let base = settings.get_num("general", "retransmit_base", DEFAULT_RETRANSMIT_BASE);
                let factor =
                    settings.get_num("general", "retransmit_factor", DEFAULT_RETRANSMIT_FACTOR);
                let delay = Duration::from_secs(u64::from(msg.xmits) * factor + base);
                if let Some(old) = msg.retrans.take() {
                    scheduler.cancel(old);
                }
                superseded = state.last_sent.replace(id).filter(|old| *old != id);
                match scheduler.schedule("message_retransmit", TimerKind::Retransmit(id), now + delay)
                {
                    Ok(handle) => {
                        let deadline = handle.deadline();
                        debug!("on_writable: {id:?} xmit {} retry at {deadline}", msg.xmits);
                        msg.retrans = Some(handle);
                        SendOutcome::Retrying {
                            message: id,
                            deadline,
                        }
                    }
                    Err(e) => {
                        error!("on_writable: no retry for {id:?}: {e}");
                        SendOutcome::Stalled { message: id }
                    }
                }
            }
        } else if state.received > 0 {
            superseded = state.last_sent.replace(id).filter(|old| *old != id);
            SendOutcome::Retained { message: id }
        } else {
            SendOutcome::Freed { message: id }
        };

        if msg.xmits == 1 {
            engine.post_send(msg.exchange, msg);
        }
        let exchange = msg.exchange;
        // Only the newest message of an exchange stays pending.
        if let Some(old) = superseded {
            self.free(old, scheduler);
        }
        match outcome {
            SendOutcome::Freed { .. } => {
                self.free(id, scheduler);
                // A final message nobody answered closes the exchange.
                self.exchanges.remove(&exchange);
            }
            SendOutcome::Exhausted { .. } => self.free(id, scheduler),
            _ => {}
        }
        Some(outcome)
    }

    /// A retry event fired: put the message back on its transport's queue.
    pub fn retry_fired(&mut self, id: MessageId) -> bool {
        let Some(msg) = self.messages.get_mut(&id) else {
            debug!("retry_fired: {id:?} already freed");
            return false;
        };
        msg.retrans = None;
        self.queues
            .entry(msg.transport)
            .or_default()
            .normal
            .push_back(id);
        true
    }

    /// Duplicate check for an incoming packet of `exchange`.
    pub fn on_received(
        &mut self,
        exchange: ExchangeId,
        packet: &[u8],
        scheduler: &mut Scheduler<TimerKind>,
    ) -> Received {
        let state = self.exchanges.entry(exchange).or_default();
        if state.last_received.as_deref() == Some(packet) {
            let replay = state
                .last_sent
                .filter(|id| self.messages.get(id).is_some_and(|m| m.is_final));
            debug!("on_received: dropping duplicate on {exchange:?}");
            if let Some(id) = replay {
                if let Some(msg) = self.messages.get(&id) {
                    self.queues
                        .entry(msg.transport)
                        .or_default()
                        .priority
                        .push_back(id);
                }
            }
            return Received::Duplicate {
                replayed: replay.is_some(),
            };
        }

        state.last_received = Some(Bytes::copy_from_slice(packet));
        state.received += 1;
        if let Some(last) = state.last_sent.take() {
            self.free(last, scheduler);
        }
        Received::New
    }

    fn free(&mut self, id: MessageId, scheduler: &mut Scheduler<TimerKind>) {
        if let Some(mut msg) = self.messages.remove(&id) {
            if let Some(handle) = msg.retrans.take() {
                scheduler.cancel(handle);
            }
            trace!("free: {id:?}");
        }
    }

    pub fn get(&self, id: MessageId) -> Option<&PendingMessage> {
        self.messages.get(&id)
    }

    pub fn last_sent(&self, exchange: ExchangeId) -> Option<MessageId> {
        self.exchanges.get(&exchange)?.last_sent
    }

    pub fn queued(&self, transport: TransportId) -> usize {
        self.queues.get(&transport).map_or(0, SendQueues::len)
    }

    /// Transports with something queued.
    pub fn busy_transports(&self) -> Vec<TransportId> {
        let mut busy: Vec<TransportId> = self
            .queues
            .iter()
            .filter(|(_, q)| q.len() > 0)
            .map(|(tid, _)| *tid)
            .collect();
        busy.sort();
        busy
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
