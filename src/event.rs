//! Kernel timers.
//!
//! Everything maestro must do at a future virtual instant that does not
//! come from the resource model is modeled as an `Event`: the end of a
//! sleep, the deadline of a wait or join, a kill time, the deadline of an
//! activity. Events are ordered by `(at, id)` on the [`Timeline`](crate::timeline::Timeline).

use crate::activity::ActivityId;
use crate::actor::ActorId;
use crate::time::VirtualTime;
use std::cmp::Ordering;

// ── Event ID ──────────────────────────────────────────────────────────

/// A strictly increasing timer identifier.
///
/// Two events scheduled at the same `VirtualTime` fire in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct EventId(u64);

impl EventId {
    #[inline]
    pub fn new(raw: u64) -> Self {
        EventId(raw)
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "E#{}", self.0)
    }
}

// ── Event ID Generator ───────────────────────────────────────────────

/// Deterministic, strictly-increasing event-ID generator.
#[derive(Debug, Clone, Default)]
pub struct EventIdGen {
    next: u64,
}

impl EventIdGen {
    pub fn new() -> Self {
        EventIdGen { next: 0 }
    }

    /// Mint the next event ID.
    pub fn next_id(&mut self) -> EventId {
        let id = EventId(self.next);
        self.next += 1;
        id
    }

    /// Peek at the next ID without consuming it.
    pub fn peek(&self) -> EventId {
        EventId(self.next)
    }
}

// ── Wait tokens ───────────────────────────────────────────────────────

/// Identifies one particular blocking episode of an actor.
///
/// A timer armed for a wait carries the token of that wait. When the
/// actor has been woken by something else in the meantime its token has
/// changed and the timer is stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WaitToken(u64);

impl WaitToken {
    #[inline]
    pub fn new(raw: u64) -> Self {
        WaitToken(raw)
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

// ── Event Kind ────────────────────────────────────────────────────────

/// What maestro does when a timer fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// Wake `actor` out of the blocking episode `token`: a sleep ends
    /// normally, a wait or join ends with `Timeout`.
    Wake { actor: ActorId, token: WaitToken },

    /// Kill `actor` (registered through `set_kill_time`).
    KillActor { actor: ActorId },

    /// The activity's own deadline elapsed.
    ActivityDeadline { activity: ActivityId },
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::Wake { actor, token } => write!(f, "Wake({}, #{})", actor, token.raw()),
            EventKind::KillActor { actor } => write!(f, "Kill({})", actor),
            EventKind::ActivityDeadline { activity } => write!(f, "Deadline({})", activity),
        }
    }
}

// ── Event ─────────────────────────────────────────────────────────────

/// A single kernel timer.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Event {
    pub id: EventId,
    pub at: VirtualTime,
    pub kind: EventKind,
}

impl Event {
    pub fn new(id: EventId, at: VirtualTime, kind: EventKind) -> Self {
        Event { id, at, kind }
    }
}

/// Ordering: smallest `(at, id)` first.
///
/// Rust's `BinaryHeap` is a *max*-heap, so the natural ordering is
/// reversed here to turn it into a min-heap.
impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kill(raw: u64) -> EventKind {
        EventKind::KillActor {
            actor: ActorId::new(raw),
        }
    }

    #[test]
    fn test_event_id_monotonic() {
        let mut gen = EventIdGen::new();
        let a = gen.next_id();
        let b = gen.next_id();
        assert_eq!(a.raw(), 0);
        assert_eq!(b.raw(), 1);
        assert_eq!(gen.peek().raw(), 2);
        assert!(a < b);
    }

    #[test]
    fn test_event_ordering_by_time() {
        let e1 = Event::new(EventId::new(0), VirtualTime::new(1.0), kill(1));
        let e2 = Event::new(EventId::new(1), VirtualTime::new(2.0), kill(1));
        // e1 fires first, so it is the "greater" one in reversed order.
        assert!(e1 > e2);
    }

    #[test]
    fn test_event_ordering_tiebreak_by_id() {
        let e1 = Event::new(EventId::new(0), VirtualTime::new(1.0), kill(1));
        let e2 = Event::new(EventId::new(1), VirtualTime::new(1.0), kill(2));
        assert!(e1 > e2);
    }

    #[test]
    fn test_event_display() {
        let wake = EventKind::Wake {
            actor: ActorId::new(3),
            token: WaitToken::new(9),
        };
        assert_eq!(format!("{}", EventId::new(42)), "E#42");
        assert_eq!(format!("{}", wake), "Wake(A3, #9)");
    }
}
