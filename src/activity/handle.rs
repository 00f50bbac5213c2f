//! The actor-side view of an activity.

use std::any::Any;

use crossbeam_channel::Sender;

use super::{ActivityId, ActivityKind, Payload};
use crate::error::SimResult;

/// A counted reference to an activity, held by actor code.
///
/// Handles are produced by the `*_async` primitives and by mailbox peeks.
/// Dropping one tells maestro (through a channel, never by touching kernel
/// state) that this holder is gone; the record is reclaimed at the end of
/// the scheduling pass in which its last holder disappeared.
///
/// Once a `test` or `wait` has observed the activity's terminal state, the
/// handle caches it: later calls return the same outcome without going
/// back to maestro.
pub struct Activity {
    id: ActivityId,
    kind: ActivityKind,
    outcome: Option<SimResult<()>>,
    payload: Option<Payload>,
    releases: Sender<ActivityId>,
}

impl Activity {
    pub(crate) fn new(id: ActivityId, kind: ActivityKind, releases: Sender<ActivityId>) -> Self {
        Activity {
            id,
            kind,
            outcome: None,
            payload: None,
            releases,
        }
    }

    pub fn id(&self) -> ActivityId {
        self.id
    }

    pub fn kind(&self) -> ActivityKind {
        self.kind
    }

    /// The terminal outcome, if this handle has already observed it.
    pub fn outcome(&self) -> Option<&SimResult<()>> {
        self.outcome.as_ref()
    }

    pub fn is_settled(&self) -> bool {
        self.outcome.is_some()
    }

    pub(crate) fn settle(&mut self, result: SimResult<()>, payload: Option<Payload>) {
        if self.outcome.is_none() {
            self.outcome = Some(result);
        }
        if payload.is_some() {
            self.payload = payload;
        }
    }

    /// Whether a received payload is waiting to be taken.
    pub fn has_payload(&self) -> bool {
        self.payload.is_some()
    }

    /// Take the received payload as a `T`.
    ///
    /// Returns `None` when nothing was received or when the payload is of
    /// another type; in the latter case it stays in the handle.
    pub fn take_payload<T: Any>(&mut self) -> Option<T> {
        let boxed = self.payload.take()?;
        match boxed.downcast::<T>() {
            Ok(value) => Some(*value),
            Err(other) => {
                self.payload = Some(other);
                None
            }
        }
    }
}

impl Drop for Activity {
    fn drop(&mut self) {
        // Maestro may already be gone during teardown.
        let _ = self.releases.send(self.id);
    }
}

impl std::fmt::Debug for Activity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Activity")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("outcome", &self.outcome)
            .field("has_payload", &self.payload.is_some())
            .finish()
    }
}
