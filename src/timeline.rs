//! Deterministic timer queue.
//!
//! A `BinaryHeap` with reversed `Ord` on [`Event`] acts as a min-heap keyed
//! by `(at, id)`. Event ids are strictly increasing, so two runs arming
//! the same timers in the same order fire them in the same order.

use std::collections::BinaryHeap;

use crate::event::{Event, EventId, EventIdGen, EventKind};
use crate::time::VirtualTime;

/// The timer queue owned by the kernel.
#[derive(Debug, Clone, Default)]
pub struct Timeline {
    /// Min-heap (via reversed Ord on Event).
    queue: BinaryHeap<Event>,
    id_gen: EventIdGen,
}

impl Timeline {
    pub fn new() -> Self {
        Timeline {
            queue: BinaryHeap::new(),
            id_gen: EventIdGen::new(),
        }
    }

    /// Arm a timer at `at`.
    pub fn schedule(&mut self, at: VirtualTime, kind: EventKind) -> EventId {
        let id = self.id_gen.next_id();
        self.queue.push(Event::new(id, at, kind));
        id
    }

    /// Pop the next event (earliest time, lowest ID).
    pub fn pop_next(&mut self) -> Option<Event> {
        self.queue.pop()
    }

    /// Pop the next event if it is due at or before `now`.
    pub fn pop_due(&mut self, now: VirtualTime) -> Option<Event> {
        match self.queue.peek() {
            Some(e) if e.at <= now => self.queue.pop(),
            _ => None,
        }
    }

    pub fn peek_next(&self) -> Option<&Event> {
        self.queue.peek()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Drain all events in firing order.
    pub fn drain_ordered(&mut self) -> Vec<Event> {
        let mut events = Vec::with_capacity(self.queue.len());
        while let Some(e) = self.queue.pop() {
            events.push(e);
        }
        events
    }
}
