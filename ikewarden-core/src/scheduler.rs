//! ## ikewarden-core::scheduler
//! **Ordered queue of timestamped events**
//!
//! The scheduler is the sole authority for "what runs next". It is generic over
//! the event payload so the daemon can dispatch fired events by pattern match.
//!
//! - Events are ordered by deadline, ties broken FIFO by insertion sequence.
//! - A [`TimerHandle`] is neither `Clone` nor `Copy`, and [`Scheduler::cancel`]
//!   consumes it: a handle can only be cancelled once.
//! - [`Scheduler::pop_due`] re-reads the head every call, so events scheduled
//!   while draining with an already-passed deadline fire in the same pass.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use tracing::{error, trace};

use crate::error::SchedulerError;
use crate::time::Timestamp;

/// Ordering key: deadline first, then insertion sequence.
type EventKey = (Timestamp, u64);

/// A scheduled event, owned by the scheduler until it fires or is cancelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event<T> {
    pub name: &'static str,
    pub deadline: Timestamp,
    pub kind: T,
}

/// Retractable reference to a pending event.
#[must_use = "dropping a TimerHandle makes the event impossible to cancel"]
#[derive(PartialEq, Eq)]
pub struct TimerHandle {
    name: &'static str,
    key: EventKey,
}

impl TimerHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn deadline(&self) -> Timestamp {
        self.key.0
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}#{}", self.name, self.key.0, self.key.1)
    }
}

pub struct Scheduler<T> {
    queue: BTreeMap<EventKey, Event<T>>,
    next_seq: u64,
    capacity: usize,
}

impl<T> Scheduler<T> {
    /// Creates a scheduler holding at most `capacity` pending events.
    pub fn with_capacity(capacity: usize) -> Result<Self, SchedulerError> {
        if capacity == 0 {
            return Err(SchedulerError::InvalidCapacity);
        }
        Ok(Self {
            queue: BTreeMap::new(),
            next_seq: 0,
            capacity,
        })
    }

    /// Inserts `kind` to fire at `deadline`.
    pub fn schedule(
        &mut self,
        name: &'static str,
        kind: T,
        deadline: Timestamp,
    ) -> Result<TimerHandle, SchedulerError> {
        if self.queue.len() >= self.capacity {
            error!(
                "schedule: cannot allocate event {name}, {} pending",
                self.queue.len()
            );
            return Err(SchedulerError::Allocation {
                name,
                capacity: self.capacity,
            });
        }

        let key = (deadline, self.next_seq);
        self.next_seq += 1;
        trace!("schedule: {name} at {deadline} (#{})", key.1);
        self.queue.insert(
            key,
            Event {
                name,
                deadline,
                kind,
            },
        );
        Ok(TimerHandle { name, key })
    }

    /// Removes the event behind `handle` and hands back its payload so the
    /// caller can drop whatever the payload was keeping alive.
    ///
    /// Returns `None` if the event already fired.
    pub fn cancel(&mut self, handle: TimerHandle) -> Option<Event<T>> {
        let removed = self.queue.remove(&handle.key);
        trace!(
            "cancel: {:?} ({})",
            handle,
            if removed.is_some() { "removed" } else { "stale" }
        );
        removed
    }

    /// Whether the event behind `handle` is still queued.
    pub fn is_pending(&self, handle: &TimerHandle) -> bool {
        self.queue.contains_key(&handle.key)
    }

    /// Duration until the earliest event, zero if it is already due.
    pub fn time_until_next(&self, now: Timestamp) -> Option<Duration> {
        self.next_deadline()
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.queue.first_key_value().map(|((deadline, _), _)| *deadline)
    }

    /// Pops the earliest event if its deadline is at or before `now`.
    pub fn pop_due(&mut self, now: Timestamp) -> Option<Event<T>> {
        match self.queue.first_key_value() {
            Some(((deadline, _), _)) if *deadline <= now => {
                self.queue.pop_first().map(|(_, event)| event)
            }
            _ => None,
        }
    }

    /// Pending events in firing order.
    pub fn iter(&self) -> impl Iterator<Item = &Event<T>> {
        self.queue.values()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
