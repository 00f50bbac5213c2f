//! Named rendezvous points.
//!
//! A mailbox queues unmatched communication descriptors of one side only.
//! Matching is eager and strictly FIFO: the moment the opposite side
//! arrives it pairs with the oldest queued descriptor.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use crate::activity::ActivityId;
use crate::actor::ActorId;

/// Which end of a communication a descriptor stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum CommSide {
    Send,
    Recv,
}

impl CommSide {
    pub fn opposite(self) -> CommSide {
        match self {
            CommSide::Send => CommSide::Recv,
            CommSide::Recv => CommSide::Send,
        }
    }
}

/// One mailbox: the rendezvous queue plus the permanent-receiver state.
#[derive(Debug, Default)]
pub(crate) struct Mailbox {
    pending: VecDeque<(ActivityId, CommSide)>,
    /// Sends started ahead of time for the permanent receiver.
    eager: VecDeque<ActivityId>,
    receiver: Option<ActorId>,
}

impl Mailbox {
    /// Pop the oldest queued descriptor if it can pair with `side`.
    pub fn take_match(&mut self, side: CommSide) -> Option<ActivityId> {
        match self.pending.front() {
            Some((_, queued)) if *queued == side.opposite() => {
                self.pending.pop_front().map(|(id, _)| id)
            }
            _ => None,
        }
    }

    /// Queue an unmatched descriptor.
    pub fn enqueue(&mut self, id: ActivityId, side: CommSide) {
        debug_assert!(
            self.pending_side().map_or(true, |s| s == side),
            "a mailbox never holds both sends and receives"
        );
        self.pending.push_back((id, side));
    }

    /// Side of the queued descriptors, if any.
    pub fn pending_side(&self) -> Option<CommSide> {
        self.pending.front().map(|(_, side)| *side)
    }

    pub fn front(&self) -> Option<ActivityId> {
        self.pending.front().map(|(id, _)| *id)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn push_eager(&mut self, id: ActivityId) {
        self.eager.push_back(id);
    }

    pub fn pop_eager(&mut self) -> Option<ActivityId> {
        self.eager.pop_front()
    }

    pub fn front_eager(&self) -> Option<ActivityId> {
        self.eager.front().copied()
    }

    /// Forget `id` wherever it is queued.
    pub fn remove(&mut self, id: ActivityId) -> bool {
        let before = self.pending.len() + self.eager.len();
        self.pending.retain(|(queued, _)| *queued != id);
        self.eager.retain(|queued| *queued != id);
        before != self.pending.len() + self.eager.len()
    }

    /// Nothing queued on either side, nothing started ahead of time.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.eager.is_empty()
    }

    /// The send a `get` would pair with next.
    pub fn next_incoming(&self) -> Option<ActivityId> {
        self.front_eager().or_else(|| match self.pending.front() {
            Some((id, CommSide::Send)) => Some(*id),
            _ => None,
        })
    }

    /// Whether a receiver calling `get` now would find something.
    pub fn has_incoming(&self) -> bool {
        self.pending_side() == Some(CommSide::Send) || !self.eager.is_empty()
    }

    pub fn receiver(&self) -> Option<ActorId> {
        self.receiver
    }

    pub fn set_receiver(&mut self, receiver: Option<ActorId>) {
        self.receiver = receiver;
    }
}

/// Every mailbox of the simulation, created on first use.
#[derive(Debug, Default)]
pub(crate) struct MailboxTable {
    boxes: BTreeMap<Arc<str>, Mailbox>,
}

impl MailboxTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The interned name and the mailbox, creating it if needed.
    pub fn open(&mut self, name: &str) -> (Arc<str>, &mut Mailbox) {
        let key: Arc<str> = match self.boxes.get_key_value(name) {
            Some((k, _)) => Arc::clone(k),
            None => Arc::from(name),
        };
        let mailbox = self.boxes.entry(Arc::clone(&key)).or_default();
        (key, mailbox)
    }

    pub fn get(&self, name: &str) -> Option<&Mailbox> {
        self.boxes.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Mailbox> {
        self.boxes.get_mut(name)
    }

    /// Empty every queue, returning what was queued.
    pub fn drain(&mut self) -> Vec<ActivityId> {
        let mut drained = Vec::new();
        for mailbox in self.boxes.values_mut() {
            drained.extend(mailbox.pending.drain(..).map(|(id, _)| id));
            drained.extend(mailbox.eager.drain(..));
        }
        drained
    }

    /// Clear every permanent-receiver binding held by `actor`.
    pub fn forget_receiver(&mut self, actor: ActorId) {
        for mailbox in self.boxes.values_mut() {
            if mailbox.receiver == Some(actor) {
                mailbox.receiver = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn id(i: u32) -> ActivityId {
        ActivityId::new(i, 0)
    }

    #[test]
    fn test_queue_then_match() {
        let mut mb = Mailbox::default();
        assert_eq!(mb.take_match(CommSide::Send), None);
        mb.enqueue(id(0), CommSide::Recv);
        mb.enqueue(id(1), CommSide::Recv);
        assert_eq!(mb.pending_side(), Some(CommSide::Recv));

        // A receive does not pair with receives.
        assert_eq!(mb.take_match(CommSide::Recv), None);
        assert_eq!(mb.take_match(CommSide::Send), Some(id(0)));
        assert_eq!(mb.front(), Some(id(1)));
        assert!(!mb.has_incoming());
    }

    #[test]
    fn test_remove_and_eager() {
        let mut mb = Mailbox::default();
        mb.enqueue(id(0), CommSide::Send);
        mb.push_eager(id(1));
        assert!(mb.has_incoming());
        assert!(mb.remove(id(0)));
        assert!(!mb.remove(id(0)));
        assert_eq!(mb.front_eager(), Some(id(1)));
        assert_eq!(mb.pop_eager(), Some(id(1)));
        assert_eq!(mb.pending_len(), 0);
    }

    #[test]
    fn test_next_incoming_prefers_eager_sends() {
        let mut mb = Mailbox::default();
        assert!(mb.is_empty());
        mb.enqueue(id(0), CommSide::Recv);
        assert!(!mb.is_empty());
        assert_eq!(mb.next_incoming(), None);
        assert_eq!(mb.take_match(CommSide::Send), Some(id(0)));

        mb.enqueue(id(1), CommSide::Send);
        assert_eq!(mb.next_incoming(), Some(id(1)));
        mb.push_eager(id(2));
        assert_eq!(mb.next_incoming(), Some(id(2)));
    }

    #[test]
    fn test_table_interns_names() {
        let mut table = MailboxTable::new();
        let (a, _) = table.open("box");
        let (b, mb) = table.open("box");
        mb.set_receiver(Some(ActorId::new(2)));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(table.get("box").and_then(|m| m.receiver()), Some(ActorId::new(2)));

        table.forget_receiver(ActorId::new(2));
        assert_eq!(table.get_mut("box").and_then(|m| m.receiver()), None);

        table.open("box").1.push_eager(id(4));
        table.open("other").1.enqueue(id(5), CommSide::Recv);
        assert_eq!(table.drain(), vec![id(4), id(5)]);
        assert!(table.get("box").is_some_and(Mailbox::is_empty));
    }

    proptest! {
        /// However sends and receives interleave, the n-th send pairs
        /// with the n-th receive.
        #[test]
        fn prop_fifo_pairing(sides in proptest::collection::vec(any::<bool>(), 0..64)) {
            let mut mb = Mailbox::default();
            let mut sends = Vec::new();
            let mut recvs = Vec::new();
            let mut pairs = Vec::new();

            for (i, is_send) in sides.into_iter().enumerate() {
                let me = id(i as u32);
                let side = if is_send { CommSide::Send } else { CommSide::Recv };
                if is_send { sends.push(me) } else { recvs.push(me) }
                match mb.take_match(side) {
                    Some(other) if is_send => pairs.push((me, other)),
                    Some(other) => pairs.push((other, me)),
                    None => mb.enqueue(me, side),
                }
            }

            for (n, (send, recv)) in pairs.iter().enumerate() {
                prop_assert_eq!(*send, sends[n]);
                prop_assert_eq!(*recv, recvs[n]);
            }
            prop_assert_eq!(pairs.len(), sends.len().min(recvs.len()));
        }
    }
}
