//! Mailbox rendezvous: matching sends with receives, permanent receivers
//! and mailbox queries.

use std::sync::Arc;

use tracing::{debug, trace};

use super::Kernel;
use crate::activity::{
    ActivityDetail, ActivityId, ActivityKind, ActivityState, CommRecord, CommRole, CommSpec,
    Payload, Queued,
};
use crate::actor::ActorId;
use crate::error::{KernelError, KernelResult};
use crate::mailbox::CommSide;
use crate::model::Demand;
use crate::platform::HostId;
use crate::simcall::{MailboxQuery, Reply};

/// The smaller of two optional rate caps.
fn min_rate(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (x, None) => x,
        (None, y) => y,
    }
}

impl Kernel {
    fn host_of(&self, actor: ActorId) -> KernelResult<HostId> {
        self.actors
            .get(&actor)
            .map(|e| e.host)
            .ok_or_else(|| KernelError::invalid_state(actor.to_string(), "not a live actor"))
    }

    pub(super) fn sc_comm_start(
        &mut self,
        caller: ActorId,
        spec: CommSpec,
        detached: bool,
    ) -> KernelResult<()> {
        let host = self.host_of(caller)?;
        let CommSpec {
            mailbox,
            role,
            rate,
            timeout,
        } = spec;
        let id = match role {
            CommRole::Put { payload, bytes } => {
                self.start_put(caller, host, &mailbox, payload, bytes, rate, detached)
            }
            CommRole::Get if detached => {
                return Err(KernelError::invalid_state(
                    self.actor_name(caller),
                    "only sends can be detached",
                ))
            }
            CommRole::Get => self.start_get(caller, host, &mailbox, rate),
        };
        self.arm_deadline(id, timeout);

        if detached {
            self.reply(caller, Ok(Reply::Unit));
        } else {
            // The caller's handle.
            self.arena.retain(id);
            self.reply(caller, Ok(Reply::Activity(id, ActivityKind::Comm)));
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn start_put(
        &mut self,
        caller: ActorId,
        host: HostId,
        mailbox: &str,
        payload: Payload,
        bytes: f64,
        rate: Option<f64>,
        detached: bool,
    ) -> ActivityId {
        let owner = (!detached).then_some(caller);
        let (name, mbox) = self.mailboxes.open(mailbox);
        let matched = mbox.take_match(CommSide::Send);
        let bound = mbox.receiver().filter(|r| self.actors.contains_key(r));

        if let Some(peer) = matched {
            if let Some(comm) = self.arena.get_mut(peer).and_then(|r| r.comm_mut()) {
                comm.sender = Some(caller);
                comm.src_host = Some(host);
                comm.payload = Some(payload);
                comm.bytes = bytes;
                comm.rate = min_rate(comm.rate, rate);
                comm.queued = Queued::No;
            }
            self.arena.release(peer);
            self.adopt(peer, owner, detached);
            debug!(activity = %peer, mailbox = %name, "send matched a queued receive");
            self.start_transfer(peer);
            return peer;
        }

        let dst_host = bound.and_then(|r| self.actors.get(&r).map(|e| e.host));
        let queued = if bound.is_some() {
            Queued::Eager
        } else {
            Queued::Pending
        };
        let id = self.create_activity(
            ActivityDetail::Comm(CommRecord {
                mailbox: Arc::clone(&name),
                sender: Some(caller),
                receiver: bound,
                src_host: Some(host),
                dst_host,
                bytes,
                rate,
                payload: Some(payload),
                queued,
            }),
            owner,
        );
        if let Some(rec) = self.arena.get_mut(id) {
            rec.detached = detached;
        }
        // The mailbox's hold.
        self.arena.retain(id);
        let (_, mbox) = self.mailboxes.open(&name);
        match queued {
            Queued::Eager => {
                mbox.push_eager(id);
                trace!(activity = %id, mailbox = %name, "eager send to the permanent receiver");
                self.start_transfer(id);
            }
            _ => {
                mbox.enqueue(id, CommSide::Send);
                trace!(activity = %id, mailbox = %name, "send queued");
            }
        }
        id
    }

    fn start_get(&mut self, caller: ActorId, host: HostId, mailbox: &str, rate: Option<f64>) -> ActivityId {
        let (name, mbox) = self.mailboxes.open(mailbox);
        if let Some(eager) = mbox.pop_eager() {
            if let Some(comm) = self.arena.get_mut(eager).and_then(|r| r.comm_mut()) {
                comm.receiver = Some(caller);
                comm.queued = Queued::No;
            }
            self.arena.release(eager);
            self.adopt(eager, Some(caller), false);
            debug!(activity = %eager, mailbox = %name, "receive claimed an eager send");
            return eager;
        }

        if let Some(peer) = mbox.take_match(CommSide::Recv) {
            if let Some(comm) = self.arena.get_mut(peer).and_then(|r| r.comm_mut()) {
                comm.receiver = Some(caller);
                comm.dst_host = Some(host);
                comm.rate = min_rate(comm.rate, rate);
                comm.queued = Queued::No;
            }
            self.arena.release(peer);
            self.adopt(peer, Some(caller), false);
            debug!(activity = %peer, mailbox = %name, "receive matched a queued send");
            self.start_transfer(peer);
            return peer;
        }

        let id = self.create_activity(
            ActivityDetail::Comm(CommRecord {
                mailbox: Arc::clone(&name),
                sender: None,
                receiver: Some(caller),
                src_host: None,
                dst_host: Some(host),
                bytes: 0.0,
                rate,
                payload: None,
                queued: Queued::Pending,
            }),
            Some(caller),
        );
        self.arena.retain(id);
        let (_, mbox) = self.mailboxes.open(&name);
        mbox.enqueue(id, CommSide::Recv);
        trace!(activity = %id, mailbox = %name, "receive queued");
        id
    }

    /// Record the second initiator of a matched communication.
    fn adopt(&mut self, id: ActivityId, owner: Option<ActorId>, detached: bool) {
        if let Some(rec) = self.arena.get_mut(id) {
            if let Some(owner) = owner {
                if !rec.owners.contains(&owner) {
                    rec.owners.push(owner);
                }
            }
            rec.detached |= detached;
        }
        if let Some(owner) = owner {
            let live = self.arena.get(id).is_some_and(|r| !r.state.is_terminal());
            if let Some(entry) = self.actors.get_mut(&owner) {
                if live {
                    entry.owned.insert(id);
                }
            }
        }
    }

    /// Hand a fully matched communication to the resource model.
    fn start_transfer(&mut self, id: ActivityId) {
        let Some(comm) = self.arena.get(id).and_then(|r| r.comm()) else {
            return;
        };
        let (Some(src), Some(dst)) = (comm.src_host, comm.dst_host) else {
            return;
        };
        let demand = Demand::Transfer {
            src,
            dst,
            route: self.platform.route(src, dst),
            bytes: comm.bytes,
            rate: comm.rate,
        };
        self.start_activity(id, demand);
    }

    // ── Queries ───────────────────────────────────────────────────────

    pub(super) fn mailbox_query(&self, mailbox: &str, query: MailboxQuery) -> Reply {
        let mbox = self.mailboxes.get(mailbox);
        match query {
            MailboxQuery::Empty => Reply::Bool(mbox.map_or(true, |m| m.is_empty())),
            MailboxQuery::Ready => {
                let done = mbox
                    .and_then(|m| m.next_incoming())
                    .and_then(|id| self.arena.get(id))
                    .is_some_and(|rec| rec.state == ActivityState::Done);
                Reply::Bool(done)
            }
            MailboxQuery::ListenFrom => Reply::Actor(
                mbox.and_then(|m| m.next_incoming())
                    .and_then(|id| self.arena.get(id))
                    .and_then(|rec| rec.comm())
                    .and_then(|c| c.sender),
            ),
            MailboxQuery::Receiver => Reply::Actor(mbox.and_then(|m| m.receiver())),
        }
    }

    /// Reply with a new handle on the oldest communication of `mailbox`.
    /// Eager sends come first since they are already under way.
    pub(super) fn sc_front(&mut self, caller: ActorId, mailbox: &str) {
        let found = self
            .mailboxes
            .get(mailbox)
            .and_then(|m| m.front_eager().or_else(|| m.front()));
        let reply = match found {
            Some(id) => {
                self.arena.retain(id);
                Reply::Peeked(Some((id, ActivityKind::Comm)))
            }
            None => Reply::Peeked(None),
        };
        self.reply(caller, Ok(reply));
    }

    /// Bind or unbind the permanent receiver of `mailbox`. Sends already
    /// queued there start right away toward the new receiver.
    pub(super) fn sc_set_receiver(
        &mut self,
        caller: ActorId,
        mailbox: &str,
        receiver: Option<ActorId>,
    ) -> KernelResult<()> {
        let dst_host = match receiver {
            Some(r) => Some(self.host_of(r).map_err(|_| {
                KernelError::invalid_state(
                    self.actor_name(caller),
                    format!("{} cannot receive: it is not alive", r),
                )
            })?),
            None => None,
        };
        let (name, mbox) = self.mailboxes.open(mailbox);
        mbox.set_receiver(receiver);
        debug!(mailbox = %name, receiver = ?receiver, "permanent receiver set");

        let mut promoted = Vec::new();
        if receiver.is_some() && mbox.pending_side() == Some(CommSide::Send) {
            while let Some(id) = mbox.take_match(CommSide::Recv) {
                mbox.push_eager(id);
                promoted.push(id);
            }
        }
        for id in promoted {
            if let Some(comm) = self.arena.get_mut(id).and_then(|r| r.comm_mut()) {
                comm.receiver = receiver;
                comm.dst_host = dst_host;
                comm.queued = Queued::Eager;
            }
            self.start_transfer(id);
        }
        self.reply(caller, Ok(Reply::Unit));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::min_rate;

    #[test]
    fn test_min_rate() {
        assert_eq!(min_rate(None, None), None);
        assert_eq!(min_rate(Some(3.0), None), Some(3.0));
        assert_eq!(min_rate(None, Some(2.0)), Some(2.0));
        assert_eq!(min_rate(Some(3.0), Some(2.0)), Some(2.0));
    }
}
