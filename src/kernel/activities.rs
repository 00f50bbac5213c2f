//! Activity handling: executions, test/wait, cancellation, completions,
//! waking waiters and reclaiming records.

use tracing::{debug, trace, warn};

use super::{Blocker, Kernel, Schedule, WaitMode};
use crate::activity::{
    ActivityDetail, ActivityId, ActivityKind, ActivityRecord, ActivityState, ExecRecord, ExecSpec,
    Failure, Queued,
};
use crate::actor::ActorId;
use crate::error::{KernelError, KernelResult, SimError};
use crate::event::EventKind;
use crate::model::{Demand, ResourceHandle};
use crate::observer::{ChangeKind, Subject};
use crate::simcall::{Outcome, Reply};

impl Kernel {
    // ── Creation ──────────────────────────────────────────────────────

    /// Store a new record with one counted handle for its initiator.
    pub(super) fn create_activity(&mut self, detail: ActivityDetail, owner: Option<ActorId>) -> ActivityId {
        let now = self.now;
        let id = self.arena.insert(|id| {
            let mut rec = ActivityRecord::new(id, detail, now);
            if let Some(owner) = owner {
                rec.owners.push(owner);
            }
            rec
        });
        let kind = self.arena.get(id).map(ActivityRecord::kind);
        if let Some(owner) = owner {
            if let Some(entry) = self.actors.get_mut(&owner) {
                entry.owned.insert(id);
            }
        }
        if let Some(kind) = kind {
            self.emit(Subject::Activity(id), ChangeKind::ActivityCreated(kind));
        }
        id
    }

    /// Init → Started, handing the demand to the resource model.
    pub(super) fn start_activity(&mut self, id: ActivityId, demand: Demand) {
        let now = self.now;
        let Some(rec) = self.arena.get_mut(id) else {
            return;
        };
        if rec.transition(ActivityState::Started, now).is_err() {
            return;
        }
        let handle = self.model.attach(id, demand, now);
        rec.resource = Some(handle);
        rec.refs += 1;
        if rec.suspended {
            self.model.suspend(handle, now);
        }
        self.resources.insert(handle, id);
        debug!(activity = %id, resource = %handle, "started");
        self.emit(Subject::Activity(id), ChangeKind::ActivityStarted);
    }

    /// Fail the activity with `Timeout` if still running after `secs`.
    pub(super) fn arm_deadline(&mut self, id: ActivityId, secs: Option<f64>) {
        let Some(at) = secs.and_then(|s| self.now.plus(s.max(0.0))) else {
            return;
        };
        if let Some(rec) = self.arena.get_mut(id) {
            rec.deadline = Some(at);
        }
        self.timeline
            .schedule(at, EventKind::ActivityDeadline { activity: id });
    }

    pub(super) fn sc_exec_start(&mut self, caller: ActorId, spec: ExecSpec) -> KernelResult<()> {
        let hosts = if spec.hosts.is_empty() {
            vec![self.actors.get(&caller).map(|e| e.host).ok_or_else(|| {
                KernelError::invalid_state(caller.to_string(), "exec from an unregistered actor")
            })?]
        } else {
            spec.hosts.clone()
        };
        if let Some(unknown) = hosts.iter().find(|h| !self.platform.has_host(**h)) {
            return Err(KernelError::UnknownHost(*unknown));
        }

        let demand = Demand::Compute {
            hosts: hosts
                .iter()
                .map(|h| (*h, self.platform.host_speed(*h)))
                .collect(),
            flops: spec.flops,
            priority: spec.priority,
            bound: spec.bound,
        };
        let id = self.create_activity(
            ActivityDetail::Exec(ExecRecord {
                hosts,
                flops: spec.flops,
                priority: spec.priority,
                bound: spec.bound,
            }),
            Some(caller),
        );
        // The caller's handle.
        self.arena.retain(id);
        self.start_activity(id, demand);
        self.arm_deadline(id, spec.timeout);
        self.reply(caller, Ok(Reply::Activity(id, ActivityKind::Exec)));
        Ok(())
    }

    // ── Settling ──────────────────────────────────────────────────────

    /// Move a running activity to a terminal state and release everything
    /// it holds. Terminal activities are left untouched.
    pub(super) fn settle(&mut self, id: ActivityId, state: ActivityState) {
        let now = self.now;
        let Some(rec) = self.arena.get_mut(id) else {
            return;
        };
        if rec.transition(state, now).is_err() {
            trace!(activity = %id, current = %rec.state, "already terminal");
            return;
        }
        let resource = rec.resource.take();
        // A finished eager send stays queued until its receiver claims it.
        let queued = match rec.comm_mut() {
            Some(c) if state == ActivityState::Done && c.queued == Queued::Eager => Queued::No,
            Some(c) => std::mem::replace(&mut c.queued, Queued::No),
            None => Queued::No,
        };
        let mailbox = rec.comm().map(|c| c.mailbox.clone());
        let waiters = rec.waiters.clone();
        let owners = rec.owners.clone();
        // A failed or canceled send never delivers its payload.
        if state != ActivityState::Done {
            if let Some(comm) = rec.comm_mut() {
                comm.payload = None;
            }
        }

        if let Some(handle) = resource {
            self.model.detach(handle);
            self.resources.remove(&handle);
            self.arena.release(id);
        }
        if queued != Queued::No {
            if let Some(mbox) = mailbox.and_then(|name| self.mailboxes.get_mut(&name)) {
                mbox.remove(id);
            }
            self.arena.release(id);
        }
        for owner in owners {
            if let Some(entry) = self.actors.get_mut(&owner) {
                entry.owned.remove(&id);
            }
        }

        debug!(activity = %id, state = %state, "settled");
        let kind = match state {
            ActivityState::Done => ChangeKind::ActivityDone,
            ActivityState::Failed(f) => ChangeKind::ActivityFailed(f),
            _ => ChangeKind::ActivityCanceled,
        };
        self.emit(Subject::Activity(id), kind);
        for waiter in waiters {
            self.mark_dirty(waiter);
        }
    }

    /// Freeze (`suspend = true`) or thaw a running activity. Terminal
    /// activities and repeated requests are no-ops. A pending comm keeps
    /// the flag and starts frozen once matched.
    pub(super) fn sc_activity_suspend(
        &mut self,
        caller: ActorId,
        id: ActivityId,
        suspend: bool,
    ) -> KernelResult<()> {
        self.check_known(caller, &[id])?;
        let now = self.now;
        let changed = match self.arena.get_mut(id) {
            Some(rec) if !rec.state.is_terminal() && rec.suspended != suspend => {
                rec.suspended = suspend;
                Some(rec.resource)
            }
            _ => None,
        };
        if let Some(resource) = changed {
            if let Some(handle) = resource {
                if suspend {
                    self.model.suspend(handle, now);
                } else {
                    self.model.resume(handle, now);
                }
            }
            debug!(activity = %id, suspend, "activity suspension changed");
            let kind = if suspend {
                ChangeKind::ActivitySuspended
            } else {
                ChangeKind::ActivityResumed
            };
            self.emit(Subject::Activity(id), kind);
        }
        self.reply(caller, Ok(Reply::Unit));
        Ok(())
    }

    pub(super) fn cancel_activity(&mut self, id: ActivityId) {
        self.settle(id, ActivityState::Canceled);
    }

    pub(super) fn on_completion(&mut self, handle: ResourceHandle, outcome: Result<(), Failure>) {
        let Some(id) = self.resources.get(&handle).copied() else {
            // Detached after a cancel; the model already forgot it too.
            trace!(resource = %handle, "completion of a detached resource");
            return;
        };
        let state = match outcome {
            Ok(()) => ActivityState::Done,
            Err(f) => ActivityState::Failed(f),
        };
        self.settle(id, state);
    }

    pub(super) fn on_deadline(&mut self, id: ActivityId) {
        debug!(activity = %id, "activity deadline reached");
        self.settle(id, ActivityState::Failed(Failure::Timeout));
    }

    /// The outcome of a terminal activity as seen by `actor`. The
    /// receiver of a completed communication also gets the payload, once.
    pub(super) fn outcome_for(&mut self, actor: ActorId, id: ActivityId) -> Outcome {
        let Some(rec) = self.arena.get_mut(id) else {
            return Outcome {
                result: Err(SimError::OperationCanceled),
                payload: None,
            };
        };
        let result = rec.state.outcome().unwrap_or(Err(SimError::OperationCanceled));
        let payload = match rec.comm_mut() {
            Some(comm) if result.is_ok() && comm.receiver == Some(actor) => comm.payload.take(),
            _ => None,
        };
        Outcome { result, payload }
    }

    fn is_terminal(&self, id: ActivityId) -> bool {
        self.arena.get(id).is_some_and(|r| r.state.is_terminal())
    }

    fn check_known(&self, caller: ActorId, ids: &[ActivityId]) -> KernelResult<()> {
        match ids.iter().find(|id| !self.arena.contains(**id)) {
            Some(id) => Err(KernelError::invalid_state(
                self.actor_name(caller),
                format!("{} is not a live activity", id),
            )),
            None => Ok(()),
        }
    }

    /// Waiting on a detached communication is reserved to its receiver.
    fn check_detached(&self, caller: ActorId, ids: &[ActivityId]) -> KernelResult<()> {
        for id in ids {
            if let Some(rec) = self.arena.get(*id) {
                let receiver = rec.comm().and_then(|c| c.receiver);
                if rec.detached && receiver != Some(caller) {
                    return Err(KernelError::invalid_state(
                        self.actor_name(caller),
                        format!("waiting on detached {}", id),
                    ));
                }
            }
        }
        Ok(())
    }

    // ── test / wait ───────────────────────────────────────────────────

    pub(super) fn sc_test(&mut self, caller: ActorId, id: ActivityId) -> KernelResult<()> {
        self.check_known(caller, &[id])?;
        let reply = if self.is_terminal(id) {
            Reply::Settled(self.outcome_for(caller, id))
        } else {
            Reply::Pending
        };
        self.reply(caller, Ok(reply));
        Ok(())
    }

    pub(super) fn sc_test_any(&mut self, caller: ActorId, ids: Vec<ActivityId>) -> KernelResult<()> {
        self.check_known(caller, &ids)?;
        let reply = match ids.iter().position(|id| self.is_terminal(*id)) {
            Some(i) => Reply::Index(i, self.outcome_for(caller, ids[i])),
            None => Reply::Pending,
        };
        self.reply(caller, Ok(reply));
        Ok(())
    }

    /// Reply right away if the wait is already satisfied, otherwise block
    /// the caller on every listed activity.
    pub(super) fn sc_wait(
        &mut self,
        caller: ActorId,
        list: Vec<ActivityId>,
        mode: WaitMode,
        timeout: Option<f64>,
    ) -> KernelResult<()> {
        self.check_known(caller, &list)?;
        self.check_detached(caller, &list)?;
        if list.is_empty() {
            match (mode, timeout) {
                (WaitMode::All, _) => {
                    self.reply(caller, Ok(Reply::All(Vec::new())));
                    return Ok(());
                }
                (_, None) => {
                    return Err(KernelError::invalid_state(
                        self.actor_name(caller),
                        "wait_any on an empty set without a timeout",
                    ))
                }
                _ => {}
            }
        }

        if let Some(reply) = self.ready_reply(caller, &list, mode) {
            self.reply(caller, Ok(reply));
            return Ok(());
        }
        if matches!(timeout, Some(t) if t <= 0.0) {
            self.reply(caller, Err(SimError::Timeout));
            return Ok(());
        }

        let token = self.mint_token();
        for id in &list {
            if let Some(rec) = self.arena.get_mut(*id) {
                if !rec.waiters.contains(&caller) {
                    rec.waiters.push(caller);
                }
            }
        }
        if let Some(entry) = self.actors.get_mut(&caller) {
            entry.state = Schedule::Blocked(Blocker::Activities { list, mode, token });
        }
        self.arm_wake(caller, token, timeout);
        Ok(())
    }

    /// The reply a wait gets if it is satisfied now.
    fn ready_reply(&mut self, actor: ActorId, list: &[ActivityId], mode: WaitMode) -> Option<Reply> {
        match mode {
            WaitMode::One => {
                let id = *list.first()?;
                self.is_terminal(id)
                    .then(|| Reply::Settled(self.outcome_for(actor, id)))
            }
            WaitMode::Any => {
                let i = list.iter().position(|id| self.is_terminal(*id))?;
                Some(Reply::Index(i, self.outcome_for(actor, list[i])))
            }
            WaitMode::All => {
                if !list.iter().all(|id| self.is_terminal(*id)) {
                    return None;
                }
                let outcomes = list.iter().map(|id| self.outcome_for(actor, *id)).collect();
                Some(Reply::All(outcomes))
            }
        }
    }

    /// Re-evaluate the waits of every actor touched by a settlement.
    pub(super) fn flush_dirty(&mut self) {
        while let Some(actor) = self.dirty.pop_front() {
            self.dirty_set.remove(&actor);
            let (list, mode) = match self.actors.get(&actor).map(|e| &e.state) {
                Some(Schedule::Blocked(Blocker::Activities { list, mode, .. })) => (list.clone(), *mode),
                _ => continue,
            };
            let Some(reply) = self.ready_reply(actor, &list, mode) else {
                continue;
            };
            for id in &list {
                if let Some(rec) = self.arena.get_mut(*id) {
                    rec.waiters.retain(|w| *w != actor);
                }
            }
            trace!(%actor, reply = reply.describe(), "wait satisfied");
            self.reply(actor, Ok(reply));
        }
    }

    pub(super) fn sc_cancel(&mut self, caller: ActorId, id: ActivityId) -> KernelResult<()> {
        self.check_known(caller, &[id])?;
        self.cancel_activity(id);
        let outcome = self.outcome_for(caller, id);
        self.reply(caller, Ok(Reply::Settled(outcome)));
        Ok(())
    }

    // ── Reclaiming ────────────────────────────────────────────────────

    /// Every actor is gone: cancel what is still in flight, drop sends
    /// nobody claimed and reclaim the records.
    pub(super) fn abandon_activities(&mut self) {
        for id in self.arena.ids() {
            if !self.is_terminal(id) {
                debug!(activity = %id, "abandoned at end of run");
                self.cancel_activity(id);
            }
        }
        for id in self.mailboxes.drain() {
            let was_queued = self
                .arena
                .get_mut(id)
                .and_then(|rec| rec.comm_mut())
                .is_some_and(|c| std::mem::replace(&mut c.queued, Queued::No) != Queued::No);
            if was_queued {
                self.arena.release(id);
            }
        }
        self.drain_releases();
        self.sweep();
    }

    /// Apply the handle drops reported by actor code.
    pub(super) fn drain_releases(&mut self) {
        while let Ok(id) = self.releases_rx.try_recv() {
            if !self.arena.release(id) {
                warn!(activity = %id, "release of an activity nobody holds");
            }
        }
    }

    /// Free every record whose handle count reached zero.
    pub(super) fn sweep(&mut self) {
        for rec in self.arena.sweep() {
            if let Some(handle) = rec.resource {
                // Only reachable for records that were never settled.
                self.model.detach(handle);
                self.resources.remove(&handle);
            }
            for owner in &rec.owners {
                if let Some(entry) = self.actors.get_mut(owner) {
                    entry.owned.remove(&rec.id);
                }
            }
            trace!(activity = %rec.id, "freed");
            self.emit(Subject::Activity(rec.id), ChangeKind::ActivityDestroyed);
        }
    }
}
