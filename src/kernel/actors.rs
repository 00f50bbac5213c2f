//! Actor lifecycle: spawn, kill, suspend/resume, join, migrate, timers,
//! and what happens when a context finishes.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{ActorEntry, Blocker, Kernel, Schedule};
use crate::actor::{ActorId, ActorRef, ActorSpec, ExitStatus};
use crate::config::MIN_STACK_SIZE;
use crate::context::{ContextEntry, Signal};
use crate::error::{KernelError, KernelResult, SimError};
use crate::event::{EventKind, WaitToken};
use crate::model::HostEvent;
use crate::observer::{ChangeKind, ExitKind, Subject};
use crate::platform::HostId;
use crate::simcall::Reply;
use crate::time::VirtualTime;

/// Why a spawn did not produce an actor.
pub(crate) enum SpawnError {
    HostOff,
    Allocation(String),
}

impl Kernel {
    // ── Spawning ──────────────────────────────────────────────────────

    /// Register a new actor and queue its first turn at the back of the
    /// ready queue.
    pub(crate) fn spawn_actor(&mut self, spec: ActorSpec) -> KernelResult<Result<ActorRef, SpawnError>> {
        if !self.platform.has_host(spec.host) {
            return Err(KernelError::UnknownHost(spec.host));
        }
        if self.hosts_off.contains(&spec.host) || !self.model.is_host_on(spec.host) {
            return Ok(Err(SpawnError::HostOff));
        }

        let id = ActorId::new(self.next_actor);
        let name: Arc<str> = Arc::from(spec.name.as_str());
        let entry = ContextEntry {
            actor: id,
            name: Arc::clone(&name),
            body: Arc::clone(&spec.body),
            releases: self.releases_tx.clone(),
            stack_size: spec
                .stack_size
                .unwrap_or(self.config.stack_size)
                .max(MIN_STACK_SIZE),
        };
        let context = match self.factory.create(entry) {
            Ok(context) => context,
            Err(e) => {
                warn!(actor = %name, error = %e, "cannot allocate a context");
                return Ok(Err(SpawnError::Allocation(e.to_string())));
            }
        };
        self.next_actor += 1;

        let host = spec.host;
        let kill_at = spec.kill_at;
        let daemon = spec.daemon;
        let auto_restart = spec.auto_restart;
        self.actors.insert(
            id,
            ActorEntry {
                spec,
                name: Arc::clone(&name),
                host,
                daemon,
                auto_restart,
                state: Schedule::Ready,
                suspended: false,
                killed: false,
                context: Some(context),
                owned: BTreeSet::new(),
                joiners: Vec::new(),
                kill_timer: None,
            },
        );
        debug!(actor = %id, name = %name, %host, "spawned");
        self.emit(Subject::Actor(id), ChangeKind::ActorCreated { host });
        self.ready.push_back((id, Signal::Start));
        if kill_at.is_some() {
            self.set_kill_time(id, kill_at);
        }
        Ok(Ok(ActorRef::new(id, name)))
    }

    pub(super) fn sc_spawn(&mut self, parent: ActorId, spec: ActorSpec) -> KernelResult<()> {
        let reply = match self.spawn_actor(spec)? {
            Ok(child) => Ok(Reply::Spawned(child)),
            Err(SpawnError::HostOff) => Err(SimError::HostFailure),
            Err(SpawnError::Allocation(reason)) => Err(SimError::AllocationFailure(reason)),
        };
        // The child was queued first: it runs before its parent resumes.
        self.reply(parent, reply);
        Ok(())
    }

    // ── Kill ──────────────────────────────────────────────────────────

    /// Mark `target` killed, cancel what it owns and schedule its final
    /// turn. No-op on a finished or already killed actor.
    pub(super) fn kill_actor(&mut self, target: ActorId) {
        let (owned, state) = match self.actors.get_mut(&target) {
            Some(entry) if !entry.killed => {
                entry.killed = true;
                entry.kill_timer = None;
                let owned = std::mem::take(&mut entry.owned);
                let state = std::mem::replace(&mut entry.state, Schedule::Running);
                (owned, state)
            }
            _ => return,
        };
        debug!(actor = %target, "killed");
        self.emit(Subject::Actor(target), ChangeKind::ActorKilled);

        for id in owned {
            self.cancel_activity(id);
        }

        match state {
            Schedule::Ready => {
                // Keep its place in the queue, swap the signal.
                if let Some(slot) = self.ready.iter_mut().find(|(a, _)| *a == target) {
                    let old = std::mem::replace(&mut slot.1, Signal::Terminate);
                    if let Some(entry) = self.actors.get_mut(&target) {
                        entry.state = Schedule::Ready;
                    }
                    self.drop_signal(old);
                } else {
                    self.make_ready(target, Signal::Terminate);
                }
            }
            // Its pending simcall is voided when applied.
            Schedule::Running => {}
            Schedule::Blocked(blocker) => {
                self.unblock(target, &blocker);
                self.make_ready(target, Signal::Terminate);
            }
            Schedule::Parked(signal) => {
                self.drop_signal(signal);
                self.make_ready(target, Signal::Terminate);
            }
        }
    }

    pub(super) fn kill_all_except(&mut self, spared: Option<ActorId>) {
        let victims: Vec<ActorId> = self
            .actors
            .keys()
            .copied()
            .filter(|id| Some(*id) != spared)
            .collect();
        for id in victims {
            self.kill_actor(id);
        }
    }

    /// Forget `actor` in whatever it was blocked on.
    pub(super) fn unblock(&mut self, actor: ActorId, blocker: &Blocker) {
        match blocker {
            Blocker::Activities { list, .. } => {
                for id in list {
                    if let Some(rec) = self.arena.get_mut(*id) {
                        rec.waiters.retain(|w| *w != actor);
                    }
                }
            }
            Blocker::Join { target, .. } => {
                if let Some(entry) = self.actors.get_mut(target) {
                    entry.joiners.retain(|(j, _)| *j != actor);
                }
            }
            Blocker::Mutex { mutex } => self.forget_mutex_sleeper(actor, *mutex),
            Blocker::Sleep { .. } | Blocker::Suspended => {}
        }
    }

    /// Kill every daemon once no regular actor is left.
    pub(super) fn check_daemons(&mut self) {
        let only_daemons = !self.actors.is_empty() && self.actors.values().all(|e| e.daemon);
        if only_daemons {
            debug!(daemons = self.actors.len(), "only daemons left, killing them");
            self.kill_all_except(None);
        }
    }

    // ── Suspend / resume ──────────────────────────────────────────────

    pub(super) fn sc_suspend(&mut self, caller: ActorId, target: ActorId) {
        if caller == target {
            if let Some(entry) = self.actors.get_mut(&caller) {
                entry.suspended = true;
                entry.state = Schedule::Blocked(Blocker::Suspended);
            }
            self.emit(Subject::Actor(caller), ChangeKind::ActorSuspended);
            return;
        }

        let parked = match self.actors.get_mut(&target) {
            Some(entry) if !entry.suspended && !entry.killed => {
                entry.suspended = true;
                matches!(entry.state, Schedule::Ready)
            }
            _ => {
                self.reply(caller, Ok(Reply::Unit));
                return;
            }
        };
        if parked {
            // Pull it out of the queue; the signal waits for the resume.
            if let Some(pos) = self.ready.iter().position(|(a, _)| *a == target) {
                if let Some((_, signal)) = self.ready.remove(pos) {
                    if let Some(entry) = self.actors.get_mut(&target) {
                        entry.state = Schedule::Parked(signal);
                    }
                }
            }
        }
        // A running target stops at its next yield: make_ready parks it.
        self.emit(Subject::Actor(target), ChangeKind::ActorSuspended);
        self.reply(caller, Ok(Reply::Unit));
    }

    pub(super) fn resume_actor(&mut self, target: ActorId) {
        let state = match self.actors.get_mut(&target) {
            Some(entry) if entry.suspended => {
                entry.suspended = false;
                match &entry.state {
                    Schedule::Parked(_) | Schedule::Blocked(Blocker::Suspended) => {
                        Some(std::mem::replace(&mut entry.state, Schedule::Running))
                    }
                    _ => None,
                }
            }
            _ => return,
        };
        self.emit(Subject::Actor(target), ChangeKind::ActorResumed);
        match state {
            Some(Schedule::Parked(signal)) => self.make_ready(target, signal),
            Some(_) => self.reply(target, Ok(Reply::Unit)),
            None => {}
        }
    }

    // ── Join ──────────────────────────────────────────────────────────

    pub(super) fn sc_join(
        &mut self,
        caller: ActorId,
        target: ActorId,
        timeout: Option<f64>,
    ) -> KernelResult<()> {
        if caller == target {
            let name = self.actor_name(caller);
            return Err(KernelError::invalid_state(name, "an actor cannot join itself"));
        }
        if !self.actors.contains_key(&target) {
            self.reply(caller, Ok(Reply::Unit));
            return Ok(());
        }
        if matches!(timeout, Some(t) if t <= 0.0) {
            self.reply(caller, Err(SimError::Timeout));
            return Ok(());
        }
        let token = self.mint_token();
        if let Some(entry) = self.actors.get_mut(&target) {
            entry.joiners.push((caller, token));
        }
        if let Some(entry) = self.actors.get_mut(&caller) {
            entry.state = Schedule::Blocked(Blocker::Join { target, token });
        }
        self.arm_wake(caller, token, timeout);
        Ok(())
    }

    // ── Migration, kill time, sleep ───────────────────────────────────

    pub(super) fn sc_migrate(&mut self, caller: ActorId, target: ActorId, host: HostId) -> KernelResult<()> {
        if !self.platform.has_host(host) {
            return Err(KernelError::UnknownHost(host));
        }
        if let Some(entry) = self.actors.get_mut(&target) {
            if entry.host != host {
                debug!(actor = %target, from = %entry.host, to = %host, "migrated");
                entry.host = host;
                self.emit(Subject::Actor(target), ChangeKind::ActorMigrated { to: host });
            }
        }
        self.reply(caller, Ok(Reply::Unit));
        Ok(())
    }

    pub(super) fn set_kill_time(&mut self, target: ActorId, at: Option<VirtualTime>) {
        if !self.actors.contains_key(&target) {
            return;
        }
        let timer = at.map(|t| {
            self.timeline
                .schedule(t.max(self.now), EventKind::KillActor { actor: target })
        });
        if let Some(entry) = self.actors.get_mut(&target) {
            entry.kill_timer = timer;
        }
    }

    pub(super) fn sc_sleep(&mut self, caller: ActorId, secs: f64) {
        // NaN, zero and negative durations behave like a yield.
        if !(secs > 0.0) {
            self.reply(caller, Ok(Reply::Unit));
            return;
        }
        let token = self.mint_token();
        if let Some(entry) = self.actors.get_mut(&caller) {
            entry.state = Schedule::Blocked(Blocker::Sleep { token });
        }
        self.arm_wake(caller, token, Some(secs));
    }

    /// Arm the timer ending the blocking episode `token` after `secs`.
    /// Infinite or absent durations arm nothing.
    pub(super) fn arm_wake(&mut self, actor: ActorId, token: WaitToken, secs: Option<f64>) {
        if let Some(at) = secs.and_then(|s| self.now.plus(s.max(0.0))) {
            self.timeline.schedule(at, EventKind::Wake { actor, token });
        }
    }

    /// A sleep ends normally; a wait or a join times out.
    pub(super) fn on_wake_timer(&mut self, actor: ActorId) {
        let blocker = match self.actors.get_mut(&actor) {
            Some(entry) => match std::mem::replace(&mut entry.state, Schedule::Running) {
                Schedule::Blocked(b) => b,
                other => {
                    entry.state = other;
                    return;
                }
            },
            None => return,
        };
        self.unblock(actor, &blocker);
        match blocker {
            Blocker::Sleep { .. } => self.reply(actor, Ok(Reply::Unit)),
            _ => self.reply(actor, Err(SimError::Timeout)),
        }
    }

    // ── Termination ───────────────────────────────────────────────────

    pub(super) fn finish_actor(&mut self, actor: ActorId, status: ExitStatus) -> KernelResult<()> {
        let Some(mut entry) = self.actors.remove(&actor) else {
            return Err(KernelError::invalid_state(
                actor.to_string(),
                "finished twice",
            ));
        };
        match &status {
            ExitStatus::Normal => {
                debug!(%actor, name = %entry.name, "exited");
                self.stats.exited_normally += 1;
            }
            ExitStatus::Killed => {
                debug!(%actor, name = %entry.name, "unwound after kill");
                self.stats.killed += 1;
            }
            ExitStatus::Failed(e) => {
                warn!(%actor, name = %entry.name, error = %e, "body returned an unhandled error");
                self.stats.failed += 1;
            }
            ExitStatus::Panicked(_) => {}
        }
        self.emit(Subject::Actor(actor), ChangeKind::ActorFinished(ExitKind::from(&status)));

        let owned = std::mem::take(&mut entry.owned);
        for id in owned {
            self.cancel_activity(id);
        }
        self.release_mutexes(actor);
        for (joiner, token) in std::mem::take(&mut entry.joiners) {
            let waiting = self.actors.get(&joiner).is_some_and(|j| {
                matches!(&j.state, Schedule::Blocked(Blocker::Join { token: t, .. }) if *t == token)
            });
            if waiting {
                self.reply(joiner, Ok(Reply::Unit));
            }
        }
        self.mailboxes.forget_receiver(actor);
        // Finished thread contexts are joined here.
        drop(entry.context.take());

        if let ExitStatus::Panicked(message) = status {
            return Err(KernelError::ActorPanicked {
                actor: format!("'{}' ({})", entry.name, actor),
                message,
            });
        }
        self.check_daemons();
        Ok(())
    }

    // ── Host availability ─────────────────────────────────────────────

    pub(super) fn on_host_event(&mut self, event: HostEvent) -> KernelResult<()> {
        match event {
            HostEvent::TurnedOff(host) => {
                info!(%host, now = %self.now, "host turned off");
                self.hosts_off.insert(host);
                let victims: Vec<(ActorId, Option<ActorSpec>)> = self
                    .actors
                    .iter()
                    .filter(|(_, e)| e.host == host && !e.killed)
                    .map(|(id, e)| {
                        let restart = e.auto_restart.then(|| {
                            let mut spec = e.spec.clone();
                            spec.daemon = e.daemon;
                            spec.auto_restart = true;
                            spec
                        });
                        (*id, restart)
                    })
                    .collect();
                for (id, restart) in victims {
                    if let Some(mut spec) = restart {
                        spec.host = host;
                        spec.kill_at = None;
                        self.restarts.entry(host).or_default().push(spec);
                    }
                    self.kill_actor(id);
                }
            }
            HostEvent::TurnedOn(host) => {
                info!(%host, now = %self.now, "host turned on");
                self.hosts_off.remove(&host);
                for spec in self.restarts.remove(&host).unwrap_or_default() {
                    let name = spec.name.clone();
                    match self.spawn_actor(spec)? {
                        Ok(actor) => debug!(%actor, "auto-restarted"),
                        Err(_) => warn!(actor = %name, "auto-restart failed"),
                    }
                }
            }
        }
        Ok(())
    }

    pub(super) fn actor_name(&self, actor: ActorId) -> String {
        self.actors
            .get(&actor)
            .map(|e| format!("'{}' ({})", e.name, actor))
            .unwrap_or_else(|| actor.to_string())
    }
}
