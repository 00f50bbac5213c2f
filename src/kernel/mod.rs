//! Maestro: the kernel state and the scheduling loop.
//!
//! ```text
//!   ┌──────────────────────── one round ────────────────────────┐
//!   │                                                           │
//!   │  ready queue ──► factory.run_ready(batch)                 │
//!   │                    │ every context runs to its next yield │
//!   │                    ▼                                      │
//!   │  outcomes, in batch order ──► apply simcalls / exits      │
//!   │                    │   (new replies, spawns, wakeups      │
//!   │                    │    go to the back of the queue)      │
//!   │                    ▼                                      │
//!   │  wake waiters of settled activities, sweep the arena      │
//!   │                                                           │
//!   │  ready queue empty? ──► advance the clock:                │
//!   │     min(model.next_completion_time, next live timer)      │
//!   │     model completions → timers → wake waiters             │
//!   └───────────────────────────────────────────────────────────┘
//! ```
//!
//! All kernel state lives here and is only ever touched on maestro's
//! thread, between scheduling passes. Contexts communicate with maestro
//! exclusively through simcalls, which is what makes the serial and
//! parallel factories produce identical runs.

mod activities;
mod actors;
mod comms;
mod sync;
#[cfg(test)]
mod tests;

pub(crate) use actors::SpawnError;

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, error, info, trace, warn};

use crate::activity::arena::ActivityArena;
use crate::activity::ActivityId;
use crate::actor::{ActorId, ActorRef, ActorSpec, ExitStatus};
use crate::config::SimConfig;
use crate::context::{build_factory, Context, ContextFactory, Dispatch, Signal, Wakeup, Yielded};
use crate::error::{KernelError, KernelResult};
use crate::event::{Event, EventId, EventKind, WaitToken};
use crate::eventlog::ChangeLog;
use crate::mailbox::MailboxTable;
use crate::model::{ResourceHandle, ResourceModel};
use crate::observer::{ChangeKind, Observer, StateChange, Subject};
use crate::platform::{HostId, Platform};
use crate::simcall::{Reply, Simcall, SimcallResult};
use crate::sync::{KernelMutex, MutexId};
use crate::time::VirtualTime;
use crate::timeline::Timeline;

// ── Actor bookkeeping ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitMode {
    One,
    Any,
    All,
}

/// Why a blocked actor is blocked.
pub(crate) enum Blocker {
    Activities {
        list: Vec<ActivityId>,
        mode: WaitMode,
        token: WaitToken,
    },
    Sleep {
        token: WaitToken,
    },
    Join {
        target: ActorId,
        token: WaitToken,
    },
    /// Suspended itself; only a `resume` wakes it.
    Suspended,
    /// Queued on a held mutex.
    Mutex {
        mutex: MutexId,
    },
}

impl Blocker {
    fn token(&self) -> Option<WaitToken> {
        match self {
            Blocker::Activities { token, .. }
            | Blocker::Sleep { token }
            | Blocker::Join { token, .. } => Some(*token),
            Blocker::Suspended | Blocker::Mutex { .. } => None,
        }
    }

    fn describe(&self) -> String {
        match self {
            Blocker::Activities { list, mode, .. } => {
                let ids: Vec<String> = list.iter().map(ToString::to_string).collect();
                format!("wait {:?} [{}]", mode, ids.join(", "))
            }
            Blocker::Sleep { .. } => "sleep".to_string(),
            Blocker::Join { target, .. } => format!("join {}", target),
            Blocker::Suspended => "suspended".to_string(),
            Blocker::Mutex { mutex } => format!("lock {}", mutex),
        }
    }
}

pub(crate) enum Schedule {
    /// In the ready queue.
    Ready,
    /// Resumed in the current pass; its yield has not been applied yet.
    Running,
    Blocked(Blocker),
    /// Woken while suspended. The signal is delivered on resume.
    Parked(Signal),
}

impl Schedule {
    fn describe(&self) -> String {
        match self {
            Schedule::Ready => "ready".to_string(),
            Schedule::Running => "running".to_string(),
            Schedule::Blocked(b) => format!("blocked ({})", b.describe()),
            Schedule::Parked(_) => "parked".to_string(),
        }
    }
}

pub(crate) struct ActorEntry {
    pub spec: ActorSpec,
    pub name: Arc<str>,
    pub host: HostId,
    pub daemon: bool,
    pub auto_restart: bool,
    pub state: Schedule,
    pub suspended: bool,
    pub killed: bool,
    pub context: Option<Box<dyn Context>>,
    /// Activities this actor initiated that are still running.
    pub owned: BTreeSet<ActivityId>,
    /// Actors blocked in a join on this one.
    pub joiners: Vec<(ActorId, WaitToken)>,
    pub kill_timer: Option<EventId>,
}

impl ActorEntry {
    fn actor_ref(&self, id: ActorId) -> ActorRef {
        ActorRef::new(id, Arc::clone(&self.name))
    }
}

// ── Run statistics ────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Stats {
    pub passes: u64,
    pub clock_advances: u64,
    pub exited_normally: usize,
    pub killed: usize,
    pub failed: usize,
    pub deadlocked: Vec<String>,
}

/// Where a call to [`Kernel::run`] stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunState {
    /// Nothing is left to do.
    Finished,
    /// The time limit was reached first.
    Paused,
}

enum Advance {
    Moved,
    Idle,
    Paused,
}

// ── Kernel ────────────────────────────────────────────────────────────

pub(crate) struct Kernel {
    now: VirtualTime,
    config: SimConfig,
    actors: BTreeMap<ActorId, ActorEntry>,
    next_actor: u64,
    ready: VecDeque<(ActorId, Signal)>,
    arena: ActivityArena,
    mailboxes: MailboxTable,
    timeline: Timeline,
    model: Box<dyn ResourceModel>,
    platform: Arc<dyn Platform>,
    factory: Box<dyn ContextFactory>,
    observers: Vec<Box<dyn Observer>>,
    log: Option<ChangeLog>,
    releases_tx: Sender<ActivityId>,
    releases_rx: Receiver<ActivityId>,
    /// Actors whose wait may have become satisfiable.
    dirty: VecDeque<ActorId>,
    dirty_set: BTreeSet<ActorId>,
    resources: BTreeMap<ResourceHandle, ActivityId>,
    hosts_off: BTreeSet<HostId>,
    restarts: BTreeMap<HostId, Vec<ActorSpec>>,
    mutexes: BTreeMap<MutexId, KernelMutex>,
    next_mutex: u64,
    next_token: u64,
    stats: Stats,
    finalized: bool,
}

impl Kernel {
    /// `config` must already be validated.
    pub fn new(platform: Arc<dyn Platform>, model: Box<dyn ResourceModel>, config: SimConfig) -> Self {
        let factory = build_factory(&config);
        let (releases_tx, releases_rx) = crossbeam_channel::unbounded();
        debug!(factory = factory.name(), stack_size = config.stack_size, "kernel created");
        Kernel {
            now: VirtualTime::ZERO,
            config,
            actors: BTreeMap::new(),
            next_actor: 1,
            ready: VecDeque::new(),
            arena: ActivityArena::new(),
            mailboxes: MailboxTable::new(),
            timeline: Timeline::new(),
            model,
            platform,
            factory,
            observers: Vec::new(),
            log: None,
            releases_tx,
            releases_rx,
            dirty: VecDeque::new(),
            dirty_set: BTreeSet::new(),
            resources: BTreeMap::new(),
            hosts_off: BTreeSet::new(),
            restarts: BTreeMap::new(),
            mutexes: BTreeMap::new(),
            next_mutex: 0,
            next_token: 0,
            stats: Stats::default(),
            finalized: false,
        }
    }

    pub fn now(&self) -> VirtualTime {
        self.now
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn factory_name(&self) -> &'static str {
        self.factory.name()
    }

    pub fn live_actors(&self) -> usize {
        self.actors.len()
    }

    pub fn live_activities(&self) -> usize {
        self.arena.len()
    }

    pub fn add_observer(&mut self, observer: Box<dyn Observer>) {
        self.observers.push(observer);
    }

    pub fn enable_logging(&mut self) {
        if self.log.is_none() {
            self.log = Some(ChangeLog::new());
        }
    }

    pub fn change_log(&self) -> Option<&ChangeLog> {
        self.log.as_ref()
    }

    // ── Hooks ─────────────────────────────────────────────────────────

    fn emit(&mut self, subject: Subject, kind: ChangeKind) {
        let change = StateChange {
            subject,
            kind,
            at: self.now,
        };
        trace!(%change, "state change");
        for observer in &mut self.observers {
            observer.on_change(&change);
        }
        if let Some(log) = &mut self.log {
            log.record(change);
        }
    }

    fn mint_token(&mut self) -> WaitToken {
        self.next_token += 1;
        WaitToken::new(self.next_token)
    }

    // ── Scheduling ────────────────────────────────────────────────────

    /// Queue `actor` for the next pass with `signal`, or park the signal
    /// while the actor is suspended. Terminate ignores suspension.
    fn make_ready(&mut self, actor: ActorId, signal: Signal) {
        match self.actors.get_mut(&actor) {
            Some(entry) if entry.suspended && !signal.is_terminate() => {
                entry.state = Schedule::Parked(signal);
            }
            Some(entry) => {
                entry.state = Schedule::Ready;
                self.ready.push_back((actor, signal));
            }
            None => self.drop_signal(signal),
        }
    }

    fn reply(&mut self, actor: ActorId, reply: SimcallResult) {
        self.make_ready(actor, Signal::Reply(reply));
    }

    /// Give back the handle count carried by a signal that will never be
    /// delivered.
    fn drop_signal(&mut self, signal: Signal) {
        if let Signal::Reply(Ok(reply)) = signal {
            if let Some(id) = reply.held_activity() {
                self.arena.release(id);
            }
        }
    }

    fn mark_dirty(&mut self, actor: ActorId) {
        if self.dirty_set.insert(actor) {
            self.dirty.push_back(actor);
        }
    }

    /// Run every queued actor to its next yield and apply the outcomes.
    fn run_pass(&mut self) -> KernelResult<()> {
        self.stats.passes += 1;
        let batch: Vec<(ActorId, Signal)> = self.ready.drain(..).collect();
        trace!(now = %self.now, size = batch.len(), "scheduling pass");

        let mut taken: Vec<(ActorId, Box<dyn Context>, Wakeup)> = Vec::with_capacity(batch.len());
        for (actor, signal) in batch {
            let entry = self.actors.get_mut(&actor).ok_or_else(|| {
                KernelError::invalid_state(actor.to_string(), "scheduled but not registered")
            })?;
            let context = entry.context.take().ok_or_else(|| {
                KernelError::invalid_state(entry.name.to_string(), "scheduled twice in one pass")
            })?;
            if context.is_finished() {
                return Err(KernelError::invalid_state(
                    entry.name.to_string(),
                    "scheduled after its context finished",
                ));
            }
            entry.state = Schedule::Running;
            let wakeup = Wakeup {
                now: self.now,
                host: entry.host,
                signal,
            };
            taken.push((actor, context, wakeup));
        }

        let mut contexts: Vec<(ActorId, Box<dyn Context>)> = Vec::with_capacity(taken.len());
        let mut wakeups = Vec::with_capacity(taken.len());
        for (actor, context, wakeup) in taken {
            contexts.push((actor, context));
            wakeups.push(wakeup);
        }

        let outcomes: Vec<(ActorId, Option<Yielded>)> = {
            let mut dispatches: Vec<Dispatch<'_>> = contexts
                .iter_mut()
                .zip(wakeups)
                .map(|((actor, context), wakeup)| Dispatch {
                    actor: *actor,
                    context: context.as_mut(),
                    wakeup: Some(wakeup),
                    outcome: None,
                })
                .collect();
            self.factory.run_ready(&mut dispatches);
            dispatches
                .into_iter()
                .map(|d| (d.actor, d.outcome))
                .collect()
        };

        for (actor, context) in contexts {
            if let Some(entry) = self.actors.get_mut(&actor) {
                entry.context = Some(context);
            }
        }
        self.drain_releases();

        for (actor, outcome) in outcomes {
            match outcome {
                Some(Yielded::Simcall(call)) => self.handle_simcall(actor, call)?,
                Some(Yielded::Exited(status)) => self.finish_actor(actor, status)?,
                None => {
                    return Err(KernelError::invalid_state(
                        actor.to_string(),
                        format!("{} factory skipped a ready context", self.factory.name()),
                    ))
                }
            }
        }

        self.flush_dirty();
        self.drain_releases();
        self.sweep();
        Ok(())
    }

    fn handle_simcall(&mut self, actor: ActorId, call: Simcall) -> KernelResult<()> {
        let killed = match self.actors.get(&actor) {
            Some(entry) => entry.killed,
            None => {
                return Err(KernelError::invalid_state(
                    actor.to_string(),
                    "simcall from an unregistered actor",
                ))
            }
        };
        if killed {
            // Killed earlier in this pass: the call is void.
            trace!(%actor, call = call.name(), "dropping simcall of a killed actor");
            self.make_ready(actor, Signal::Terminate);
            return Ok(());
        }
        debug!(%actor, call = call.name(), now = %self.now, "simcall");

        match call {
            Simcall::Spawn(spec) => self.sc_spawn(actor, spec),
            Simcall::Kill(target) => {
                self.kill_actor(target);
                if target == actor {
                    self.make_ready(actor, Signal::Terminate);
                } else {
                    self.reply(actor, Ok(Reply::Unit));
                }
                Ok(())
            }
            Simcall::KillAll => {
                self.kill_all_except(Some(actor));
                self.reply(actor, Ok(Reply::Unit));
                Ok(())
            }
            Simcall::Suspend(target) => {
                self.sc_suspend(actor, target);
                Ok(())
            }
            Simcall::Resume(target) => {
                self.resume_actor(target);
                self.reply(actor, Ok(Reply::Unit));
                Ok(())
            }
            Simcall::Join { target, timeout } => self.sc_join(actor, target, timeout),
            Simcall::Migrate { target, host } => self.sc_migrate(actor, target, host),
            Simcall::SetKillTime { target, at } => {
                self.set_kill_time(target, at);
                self.reply(actor, Ok(Reply::Unit));
                Ok(())
            }
            Simcall::Daemonize => {
                if let Some(entry) = self.actors.get_mut(&actor) {
                    entry.daemon = true;
                }
                self.reply(actor, Ok(Reply::Unit));
                self.check_daemons();
                Ok(())
            }
            Simcall::SetAutoRestart(enabled) => {
                if let Some(entry) = self.actors.get_mut(&actor) {
                    entry.auto_restart = enabled;
                }
                self.reply(actor, Ok(Reply::Unit));
                Ok(())
            }
            Simcall::IsAlive(target) => {
                let alive = self.actors.contains_key(&target);
                self.reply(actor, Ok(Reply::Bool(alive)));
                Ok(())
            }
            Simcall::Yield => {
                self.reply(actor, Ok(Reply::Unit));
                Ok(())
            }
            Simcall::Sleep(secs) => {
                self.sc_sleep(actor, secs);
                Ok(())
            }
            Simcall::ExecStart(spec) => self.sc_exec_start(actor, spec),
            Simcall::CommStart { spec, detached } => self.sc_comm_start(actor, spec, detached),
            Simcall::Test(id) => self.sc_test(actor, id),
            Simcall::TestAny(ids) => self.sc_test_any(actor, ids),
            Simcall::Wait { activity, timeout } => {
                self.sc_wait(actor, vec![activity], WaitMode::One, timeout)
            }
            Simcall::WaitAny {
                activities,
                timeout,
            } => self.sc_wait(actor, activities, WaitMode::Any, timeout),
            Simcall::WaitAll {
                activities,
                timeout,
            } => self.sc_wait(actor, activities, WaitMode::All, timeout),
            Simcall::Cancel(id) => self.sc_cancel(actor, id),
            Simcall::ActivitySuspend(id) => self.sc_activity_suspend(actor, id, true),
            Simcall::ActivityResume(id) => self.sc_activity_suspend(actor, id, false),
            Simcall::MutexCreate => {
                let id = self.create_mutex();
                self.reply(actor, Ok(Reply::Mutex(id)));
                Ok(())
            }
            Simcall::MutexLock(id) => self.sc_mutex_lock(actor, id),
            Simcall::MutexTryLock(id) => self.sc_mutex_try_lock(actor, id),
            Simcall::MutexUnlock(id) => self.sc_mutex_unlock(actor, id),
            Simcall::MailboxFront(name) => {
                self.sc_front(actor, &name);
                Ok(())
            }
            Simcall::MailboxListen(name) => {
                let incoming = self
                    .mailboxes
                    .get(&name)
                    .is_some_and(|mbox| mbox.has_incoming());
                self.reply(actor, Ok(Reply::Bool(incoming)));
                Ok(())
            }
            Simcall::MailboxSetReceiver { mailbox, receiver } => {
                self.sc_set_receiver(actor, &mailbox, receiver)
            }
            Simcall::MailboxQuery { mailbox, query } => {
                let reply = self.mailbox_query(&mailbox, query);
                self.reply(actor, Ok(reply));
                Ok(())
            }
        }
    }

    // ── Clock ─────────────────────────────────────────────────────────

    /// Whether a timer still means something.
    fn timer_is_live(&self, event: &Event) -> bool {
        match &event.kind {
            EventKind::Wake { actor, token } => self.actors.get(actor).is_some_and(|e| {
                matches!(&e.state, Schedule::Blocked(b) if b.token() == Some(*token))
            }),
            EventKind::KillActor { actor } => self
                .actors
                .get(actor)
                .is_some_and(|e| e.kill_timer == Some(event.id)),
            EventKind::ActivityDeadline { activity } => self
                .arena
                .get(*activity)
                .is_some_and(|r| !r.state.is_terminal()),
        }
    }

    fn next_live_timer(&mut self) -> Option<VirtualTime> {
        loop {
            let live = {
                let event = self.timeline.peek_next()?;
                self.timer_is_live(event)
            };
            if live {
                return self.timeline.peek_next().map(|e| e.at);
            }
            self.timeline.pop_next();
        }
    }

    /// Move the clock to the next instant where something happens and
    /// apply everything due then.
    fn advance_clock(&mut self, limit: Option<VirtualTime>) -> KernelResult<Advance> {
        let model_next = self.model.next_completion_time();
        let timer_next = self.next_live_timer();
        let next = match (model_next, timer_next) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) | (None, Some(a)) => a,
            (None, None) => return Ok(Advance::Idle),
        };
        let next = next.max(self.now);
        if let Some(limit) = limit {
            if next > limit {
                if limit > self.now {
                    self.now = limit;
                    self.model.advance_to(limit);
                }
                return Ok(Advance::Paused);
            }
        }
        if next > self.now {
            self.stats.clock_advances += 1;
            debug!(from = %self.now, to = %next, "advancing clock");
        }
        self.now = next;
        self.model.advance_to(next);

        // Completions first: an activity finishing exactly at a timeout
        // instant counts as finished.
        for completion in self.model.poll_completed() {
            self.on_completion(completion.handle, completion.outcome);
        }
        self.flush_dirty();

        for event in self.model.poll_host_events() {
            self.on_host_event(event)?;
        }

        while let Some(event) = self.timeline.pop_due(next) {
            if self.timer_is_live(&event) {
                self.fire_timer(event);
            }
        }
        self.flush_dirty();
        self.drain_releases();
        self.sweep();
        Ok(Advance::Moved)
    }

    fn fire_timer(&mut self, event: Event) {
        trace!(timer = %event.kind, at = %event.at, "timer fired");
        match event.kind {
            EventKind::Wake { actor, .. } => self.on_wake_timer(actor),
            EventKind::KillActor { actor } => {
                debug!(%actor, "kill time reached");
                self.kill_actor(actor);
            }
            EventKind::ActivityDeadline { activity } => self.on_deadline(activity),
        }
    }

    // ── Driver ────────────────────────────────────────────────────────

    /// Run until nothing is left to do, or until virtual time `until`.
    pub fn run(&mut self, until: Option<VirtualTime>) -> KernelResult<RunState> {
        self.check_daemons();
        let result = self.run_loop(until);
        match &result {
            Ok(RunState::Finished) => {
                info!(
                    end = %self.now,
                    passes = self.stats.passes,
                    exited = self.stats.exited_normally,
                    killed = self.stats.killed,
                    "simulation finished"
                );
                self.abandon_activities();
                self.shutdown();
            }
            Ok(RunState::Paused) => {
                debug!(now = %self.now, "paused at time limit");
            }
            Err(e) => {
                self.dump(e);
                self.shutdown();
            }
        }
        result
    }

    fn run_loop(&mut self, until: Option<VirtualTime>) -> KernelResult<RunState> {
        loop {
            if !self.ready.is_empty() {
                self.run_pass()?;
                continue;
            }
            if self.actors.is_empty() && self.restarts.values().all(Vec::is_empty) {
                return Ok(RunState::Finished);
            }
            match self.advance_clock(until)? {
                Advance::Moved => continue,
                Advance::Paused => return Ok(RunState::Paused),
                Advance::Idle if self.actors.is_empty() => return Ok(RunState::Finished),
                Advance::Idle => self.break_deadlock(),
            }
        }
    }

    /// Nothing can ever wake the remaining actors: report and kill them.
    fn break_deadlock(&mut self) {
        let stuck: Vec<ActorId> = self.actors.keys().copied().collect();
        warn!(now = %self.now, actors = stuck.len(), "deadlock: no event can wake the remaining actors");
        for id in &stuck {
            if let Some(entry) = self.actors.get(id) {
                let line = format!("'{}' ({}) {}", entry.name, id, entry.state.describe());
                warn!("  {}", line);
                self.stats.deadlocked.push(line);
            }
        }
        for id in stuck {
            self.kill_actor(id);
        }
    }

    fn dump(&self, err: &KernelError) {
        error!(now = %self.now, error = %err, "fatal kernel error, aborting");
        for (id, entry) in &self.actors {
            error!(
                actor = %id,
                name = %entry.name,
                host = %entry.host,
                state = %entry.state.describe(),
                suspended = entry.suspended,
                killed = entry.killed,
                "actor state"
            );
        }
    }

    /// Tear every remaining context down and stop the factory.
    pub fn shutdown(&mut self) {
        if self.finalized {
            return;
        }
        self.finalized = true;
        let ready: Vec<Signal> = self.ready.drain(..).map(|(_, s)| s).collect();
        for signal in ready {
            self.drop_signal(signal);
        }
        let ids: Vec<ActorId> = self.actors.keys().copied().collect();
        for id in ids {
            if let Some(mut entry) = self.actors.remove(&id) {
                // Dropping a started context unwinds its body.
                if let Some(context) = entry.context.take() {
                    trace!(actor = %id, started = context.has_started(), "tearing down context");
                    drop(context);
                }
            }
        }
        self.drain_releases();
        self.factory.finalize();
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        self.shutdown();
    }
}
