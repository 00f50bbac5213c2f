//! The in-body actor API.
//!
//! Every method that needs maestro turns into exactly one simcall: the
//! context suspends, maestro applies the call between scheduling passes,
//! and resumes the context with the answer. A killed actor gets
//! [`SimError::Terminated`] from the call it was blocked in and from every
//! call after that, without suspending again, so `?` unwinds its body.

use std::any::Any;
use std::sync::Arc;

use crossbeam_channel::Sender;

use super::{ActorId, ActorRef, ActorSpec};
use crate::activity::{Activity, ActivityId, CommSpec, ExecSpec};
use crate::context::{Signal, Transport};
use crate::error::{SimError, SimResult};
use crate::platform::HostId;
use crate::simcall::{MailboxQuery, Outcome, Reply, Simcall, SimcallResult};
use crate::sync::MutexId;
use crate::time::VirtualTime;

/// Handle given to an actor body.
///
/// ```rust
/// use simkernel::{Simulation, StaticPlatform, HostId};
///
/// let mut sim = Simulation::new(StaticPlatform::single_host(1e9));
/// sim.spawn("pinger", HostId::new(0), |me| {
///     me.put("pong", 42u32, 1e3)?;
///     Ok(())
/// })
/// .unwrap();
/// sim.spawn("ponger", HostId::new(0), |me| {
///     let v: u32 = me.get("pong")?;
///     assert_eq!(v, 42);
///     Ok(())
/// })
/// .unwrap();
/// let report = sim.run().unwrap();
/// assert_eq!(report.exited_normally, 2);
/// ```
pub struct Actor<'a> {
    id: ActorId,
    name: Arc<str>,
    host: HostId,
    now: VirtualTime,
    killed: bool,
    transport: &'a mut dyn Transport,
    releases: Sender<ActivityId>,
    exit_handlers: Vec<Box<dyn FnOnce(bool)>>,
}

impl<'a> Actor<'a> {
    pub(crate) fn new(
        id: ActorId,
        name: Arc<str>,
        host: HostId,
        now: VirtualTime,
        transport: &'a mut dyn Transport,
        releases: Sender<ActivityId>,
    ) -> Self {
        Actor {
            id,
            name,
            host,
            now,
            killed: false,
            transport,
            releases,
            exit_handlers: Vec::new(),
        }
    }

    // ── Identity ──────────────────────────────────────────────────────

    pub fn id(&self) -> ActorId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The host this actor currently runs on.
    pub fn host(&self) -> HostId {
        self.host
    }

    /// Current virtual time, as of this actor's last resumption.
    pub fn now(&self) -> VirtualTime {
        self.now
    }

    /// A reference to this actor, to hand to others.
    pub fn me(&self) -> ActorRef {
        ActorRef::new(self.id, Arc::clone(&self.name))
    }

    /// Whether this actor has been killed. Once true, every simcall fails
    /// with `Terminated`.
    pub fn is_killed(&self) -> bool {
        self.killed
    }

    // ── Simcall plumbing ──────────────────────────────────────────────

    fn call(&mut self, call: Simcall) -> SimcallResult {
        if self.killed {
            return Err(SimError::Terminated);
        }
        let wakeup = self.transport.suspend(call);
        self.now = wakeup.now;
        self.host = wakeup.host;
        match wakeup.signal {
            Signal::Reply(reply) => reply,
            Signal::Terminate => {
                self.killed = true;
                Err(SimError::Terminated)
            }
            Signal::Start => panic!("{} resumed with a second start signal", self.id),
        }
    }

    fn unexpected(&self, what: &str, reply: Reply) -> ! {
        panic!(
            "{}: maestro answered {} with a '{}' reply",
            self.id,
            what,
            reply.describe()
        )
    }

    fn call_unit(&mut self, call: Simcall) -> SimResult<()> {
        let what = call.name();
        match self.call(call)? {
            Reply::Unit => Ok(()),
            other => self.unexpected(what, other),
        }
    }

    fn call_bool(&mut self, call: Simcall) -> SimResult<bool> {
        let what = call.name();
        match self.call(call)? {
            Reply::Bool(b) => Ok(b),
            other => self.unexpected(what, other),
        }
    }

    fn call_activity(&mut self, call: Simcall) -> SimResult<Activity> {
        let what = call.name();
        match self.call(call)? {
            Reply::Activity(id, kind) => Ok(Activity::new(id, kind, self.releases.clone())),
            other => self.unexpected(what, other),
        }
    }

    fn call_actor(&mut self, call: Simcall) -> SimResult<Option<ActorId>> {
        let what = call.name();
        match self.call(call)? {
            Reply::Actor(actor) => Ok(actor),
            other => self.unexpected(what, other),
        }
    }

    fn apply(activity: &mut Activity, outcome: Outcome) -> SimResult<()> {
        activity.settle(outcome.result, outcome.payload);
        activity
            .outcome()
            .cloned()
            .unwrap_or(Err(SimError::OperationCanceled))
    }

    // ── Time ──────────────────────────────────────────────────────────

    /// Block for `secs` of virtual time.
    pub fn sleep_for(&mut self, secs: f64) -> SimResult<()> {
        self.call_unit(Simcall::Sleep(secs))
    }

    /// Block until virtual time `at`. Returns after a yield if `at` is
    /// already past.
    pub fn sleep_until(&mut self, at: VirtualTime) -> SimResult<()> {
        let secs = at.duration_since(self.now).unwrap_or(0.0);
        self.sleep_for(secs)
    }

    /// Let every other ready actor run, then continue at the same instant.
    pub fn yield_now(&mut self) -> SimResult<()> {
        self.call_unit(Simcall::Yield)
    }

    // ── Executions ────────────────────────────────────────────────────

    /// Compute `flops` on the current host and wait for it.
    pub fn execute(&mut self, flops: f64) -> SimResult<()> {
        let mut exec = self.exec_start(ExecSpec::new(flops))?;
        self.wait(&mut exec)
    }

    /// Start computing `flops` on the current host.
    pub fn exec_async(&mut self, flops: f64) -> SimResult<Activity> {
        self.exec_start(ExecSpec::new(flops))
    }

    /// Start an execution. Dropping the handle leaves it running until the
    /// model completes it.
    pub fn exec_start(&mut self, spec: ExecSpec) -> SimResult<Activity> {
        self.call_activity(Simcall::ExecStart(spec))
    }

    // ── Communications ────────────────────────────────────────────────

    /// Send `payload` (accounted as `bytes`) and wait until it is received.
    pub fn put<T: Any + Send>(&mut self, mailbox: &str, payload: T, bytes: f64) -> SimResult<()> {
        let mut comm = self.put_async(mailbox, payload, bytes)?;
        self.wait(&mut comm)
    }

    /// Like [`put`](Self::put), but give up after `timeout` seconds. The
    /// send is canceled when it times out.
    pub fn put_for<T: Any + Send>(
        &mut self,
        mailbox: &str,
        payload: T,
        bytes: f64,
        timeout: f64,
    ) -> SimResult<()> {
        let mut comm = self.put_async(mailbox, payload, bytes)?;
        match self.wait_for(&mut comm, timeout) {
            Err(SimError::Timeout) => {
                self.cancel(&mut comm)?;
                Err(SimError::Timeout)
            }
            other => other,
        }
    }

    pub fn put_async<T: Any + Send>(
        &mut self,
        mailbox: &str,
        payload: T,
        bytes: f64,
    ) -> SimResult<Activity> {
        self.comm_start(CommSpec::put(mailbox, payload, bytes))
    }

    /// Fire-and-forget send. Nobody observes its outcome; only the
    /// receiver may wait on it.
    pub fn put_detached<T: Any + Send>(
        &mut self,
        mailbox: &str,
        payload: T,
        bytes: f64,
    ) -> SimResult<()> {
        self.call_unit(Simcall::CommStart {
            spec: CommSpec::put(mailbox, payload, bytes),
            detached: true,
        })
    }

    /// Start either side of a communication.
    pub fn comm_start(&mut self, spec: CommSpec) -> SimResult<Activity> {
        self.call_activity(Simcall::CommStart {
            spec,
            detached: false,
        })
    }

    /// Receive a `T` from `mailbox`.
    ///
    /// # Panics
    ///
    /// If the matched sender put something other than a `T`.
    pub fn get<T: Any>(&mut self, mailbox: &str) -> SimResult<T> {
        let mut comm = self.get_async(mailbox)?;
        self.wait(&mut comm)?;
        Ok(self.received(mailbox, &mut comm))
    }

    /// Like [`get`](Self::get), but give up after `timeout` seconds.
    pub fn get_for<T: Any>(&mut self, mailbox: &str, timeout: f64) -> SimResult<T> {
        let mut comm = self.get_async(mailbox)?;
        match self.wait_for(&mut comm, timeout) {
            Ok(()) => Ok(self.received(mailbox, &mut comm)),
            Err(SimError::Timeout) => {
                self.cancel(&mut comm)?;
                Err(SimError::Timeout)
            }
            Err(e) => Err(e),
        }
    }

    pub fn get_async(&mut self, mailbox: &str) -> SimResult<Activity> {
        self.comm_start(CommSpec::get(mailbox))
    }

    fn received<T: Any>(&self, mailbox: &str, comm: &mut Activity) -> T {
        match comm.take_payload::<T>() {
            Some(value) => value,
            None => panic!(
                "{}: payload received on '{}' is not a {}",
                self.id,
                mailbox,
                std::any::type_name::<T>()
            ),
        }
    }

    // ── Mailbox queries ───────────────────────────────────────────────

    /// The oldest communication queued on `mailbox`, without consuming it.
    pub fn front(&mut self, mailbox: &str) -> SimResult<Option<Activity>> {
        match self.call(Simcall::MailboxFront(mailbox.to_string()))? {
            Reply::Peeked(found) => {
                Ok(found.map(|(id, kind)| Activity::new(id, kind, self.releases.clone())))
            }
            other => self.unexpected("mailbox_front", other),
        }
    }

    /// Whether a send is waiting on `mailbox`.
    pub fn listen(&mut self, mailbox: &str) -> SimResult<bool> {
        self.call_bool(Simcall::MailboxListen(mailbox.to_string()))
    }

    /// Whether nothing at all is queued on `mailbox`.
    pub fn mailbox_empty(&mut self, mailbox: &str) -> SimResult<bool> {
        self.call_bool(Simcall::MailboxQuery {
            mailbox: mailbox.to_string(),
            query: MailboxQuery::Empty,
        })
    }

    /// Whether the next message a `get` on `mailbox` would take has
    /// already been transferred.
    pub fn mailbox_ready(&mut self, mailbox: &str) -> SimResult<bool> {
        self.call_bool(Simcall::MailboxQuery {
            mailbox: mailbox.to_string(),
            query: MailboxQuery::Ready,
        })
    }

    /// Sender of the next message a `get` on `mailbox` would take.
    pub fn listen_from(&mut self, mailbox: &str) -> SimResult<Option<ActorId>> {
        self.call_actor(Simcall::MailboxQuery {
            mailbox: mailbox.to_string(),
            query: MailboxQuery::ListenFrom,
        })
    }

    pub fn receiver(&mut self, mailbox: &str) -> SimResult<Option<ActorId>> {
        self.call_actor(Simcall::MailboxQuery {
            mailbox: mailbox.to_string(),
            query: MailboxQuery::Receiver,
        })
    }

    /// Bind `mailbox` to a permanent receiver (or unbind it with `None`).
    /// Sends to a bound mailbox start right away, before a `get` exists.
    pub fn set_receiver(&mut self, mailbox: &str, receiver: Option<&ActorRef>) -> SimResult<()> {
        self.call_unit(Simcall::MailboxSetReceiver {
            mailbox: mailbox.to_string(),
            receiver: receiver.map(ActorRef::id),
        })
    }

    // ── Waiting ───────────────────────────────────────────────────────

    /// Non-blocking check. `Ok(false)` while running; once terminal, the
    /// same result `wait` gives, every time.
    pub fn test(&mut self, activity: &mut Activity) -> SimResult<bool> {
        if let Some(outcome) = activity.outcome() {
            return outcome.clone().map(|()| true);
        }
        match self.call(Simcall::Test(activity.id()))? {
            Reply::Pending => Ok(false),
            Reply::Settled(outcome) => Self::apply(activity, outcome).map(|()| true),
            other => self.unexpected("test", other),
        }
    }

    /// Block until the activity is terminal.
    pub fn wait(&mut self, activity: &mut Activity) -> SimResult<()> {
        self.wait_inner(activity, None)
    }

    /// Block until the activity is terminal or `timeout` seconds elapse.
    /// A timeout leaves the activity running.
    pub fn wait_for(&mut self, activity: &mut Activity, timeout: f64) -> SimResult<()> {
        self.wait_inner(activity, Some(timeout))
    }

    fn wait_inner(&mut self, activity: &mut Activity, timeout: Option<f64>) -> SimResult<()> {
        if let Some(outcome) = activity.outcome() {
            return outcome.clone();
        }
        match self.call(Simcall::Wait {
            activity: activity.id(),
            timeout,
        })? {
            Reply::Settled(outcome) => Self::apply(activity, outcome),
            other => self.unexpected("wait", other),
        }
    }

    /// Index of the first terminal activity of the list, if any.
    pub fn test_any(&mut self, activities: &mut [Activity]) -> SimResult<Option<usize>> {
        // A cached outcome further down the list may hide an earlier
        // activity that settled since; only index 0 can answer locally.
        if activities.first().is_some_and(Activity::is_settled) {
            return Ok(Some(0));
        }
        let ids = activities.iter().map(Activity::id).collect();
        match self.call(Simcall::TestAny(ids))? {
            Reply::Pending => Ok(None),
            Reply::Index(i, outcome) => {
                // The outcome is cached in the handle; the caller reads it.
                let _ = Self::apply(&mut activities[i], outcome);
                Ok(Some(i))
            }
            other => self.unexpected("test_any", other),
        }
    }

    /// Block until one of the activities is terminal and return its index.
    /// Activities terminal at the same instant resolve to the lowest index.
    pub fn wait_any(&mut self, activities: &mut [Activity]) -> SimResult<usize> {
        self.wait_any_inner(activities, None)
    }

    pub fn wait_any_for(&mut self, activities: &mut [Activity], timeout: f64) -> SimResult<usize> {
        self.wait_any_inner(activities, Some(timeout))
    }

    fn wait_any_inner(
        &mut self,
        activities: &mut [Activity],
        timeout: Option<f64>,
    ) -> SimResult<usize> {
        if activities.first().is_some_and(Activity::is_settled) {
            return Ok(0);
        }
        let ids = activities.iter().map(Activity::id).collect();
        match self.call(Simcall::WaitAny {
            activities: ids,
            timeout,
        })? {
            Reply::Index(i, outcome) => {
                let _ = Self::apply(&mut activities[i], outcome);
                Ok(i)
            }
            other => self.unexpected("wait_any", other),
        }
    }

    /// Block until every activity is terminal. The first failure in list
    /// order is returned once all of them have settled.
    pub fn wait_all(&mut self, activities: &mut [Activity]) -> SimResult<()> {
        self.wait_all_inner(activities, None)
    }

    pub fn wait_all_for(&mut self, activities: &mut [Activity], timeout: f64) -> SimResult<()> {
        self.wait_all_inner(activities, Some(timeout))
    }

    fn wait_all_inner(&mut self, activities: &mut [Activity], timeout: Option<f64>) -> SimResult<()> {
        let open: Vec<usize> = activities
            .iter()
            .enumerate()
            .filter(|(_, a)| !a.is_settled())
            .map(|(i, _)| i)
            .collect();
        if !open.is_empty() {
            let ids = open.iter().map(|&i| activities[i].id()).collect();
            match self.call(Simcall::WaitAll {
                activities: ids,
                timeout,
            })? {
                Reply::All(outcomes) => {
                    for (i, outcome) in open.into_iter().zip(outcomes) {
                        let _ = Self::apply(&mut activities[i], outcome);
                    }
                }
                other => self.unexpected("wait_all", other),
            }
        }
        activities
            .iter()
            .filter_map(|a| a.outcome())
            .find_map(|r| r.clone().err())
            .map_or(Ok(()), Err)
    }

    /// Cancel the activity and wake everyone waiting on it. No effect on
    /// an activity that already finished.
    pub fn cancel(&mut self, activity: &mut Activity) -> SimResult<()> {
        if activity.is_settled() {
            return Ok(());
        }
        match self.call(Simcall::Cancel(activity.id()))? {
            Reply::Settled(outcome) => {
                let _ = Self::apply(activity, outcome);
                Ok(())
            }
            other => self.unexpected("cancel", other),
        }
    }

    /// Stop the activity's progress until [`resume_activity`]. It can
    /// still fail or hit its deadline while frozen. No effect once it is
    /// terminal.
    ///
    /// [`resume_activity`]: Self::resume_activity
    pub fn suspend_activity(&mut self, activity: &Activity) -> SimResult<()> {
        if activity.is_settled() {
            return Ok(());
        }
        self.call_unit(Simcall::ActivitySuspend(activity.id()))
    }

    pub fn resume_activity(&mut self, activity: &Activity) -> SimResult<()> {
        if activity.is_settled() {
            return Ok(());
        }
        self.call_unit(Simcall::ActivityResume(activity.id()))
    }

    // ── Mutexes ───────────────────────────────────────────────────────

    pub fn mutex_create(&mut self) -> SimResult<MutexId> {
        match self.call(Simcall::MutexCreate)? {
            Reply::Mutex(id) => Ok(id),
            other => self.unexpected("mutex_create", other),
        }
    }

    /// Take `mutex`, blocking while another actor holds it. Waiters get it
    /// in the order they asked. Locking a mutex one already holds is a
    /// fatal error.
    pub fn lock(&mut self, mutex: MutexId) -> SimResult<()> {
        self.call_unit(Simcall::MutexLock(mutex))
    }

    /// Take `mutex` only if it is free.
    pub fn try_lock(&mut self, mutex: MutexId) -> SimResult<bool> {
        self.call_bool(Simcall::MutexTryLock(mutex))
    }

    /// Release `mutex`, handing it to the oldest waiter. Only the owner may
    /// unlock.
    pub fn unlock(&mut self, mutex: MutexId) -> SimResult<()> {
        self.call_unit(Simcall::MutexUnlock(mutex))
    }

    // ── Actor control ─────────────────────────────────────────────────

    /// Start a new actor. It runs in the current instant, after the actors
    /// that are already ready.
    pub fn spawn<F>(&mut self, name: &str, host: HostId, body: F) -> SimResult<ActorRef>
    where
        F: Fn(&mut Actor<'_>) -> SimResult<()> + Send + Sync + 'static,
    {
        self.spawn_with(ActorSpec::new(name, host, body))
    }

    pub fn spawn_with(&mut self, spec: ActorSpec) -> SimResult<ActorRef> {
        match self.call(Simcall::Spawn(spec))? {
            Reply::Spawned(actor) => Ok(actor),
            other => self.unexpected("spawn", other),
        }
    }

    /// Kill `target`. Killing oneself returns `Terminated` right away;
    /// killing a finished actor does nothing.
    pub fn kill(&mut self, target: &ActorRef) -> SimResult<()> {
        self.call_unit(Simcall::Kill(target.id()))
    }

    /// Kill every actor but the caller.
    pub fn kill_all(&mut self) -> SimResult<()> {
        self.call_unit(Simcall::KillAll)
    }

    /// Terminate the calling actor. Always returns `Err(Terminated)`.
    pub fn exit(&mut self) -> SimResult<()> {
        let id = self.id;
        self.call_unit(Simcall::Kill(id))?;
        Err(SimError::Terminated)
    }

    /// Take `target` off the ready list until resumed. Suspending oneself
    /// blocks until someone else resumes us.
    pub fn suspend(&mut self, target: &ActorRef) -> SimResult<()> {
        self.call_unit(Simcall::Suspend(target.id()))
    }

    pub fn suspend_self(&mut self) -> SimResult<()> {
        let id = self.id;
        self.call_unit(Simcall::Suspend(id))
    }

    pub fn resume(&mut self, target: &ActorRef) -> SimResult<()> {
        self.call_unit(Simcall::Resume(target.id()))
    }

    /// Block until `target` finishes.
    pub fn join(&mut self, target: &ActorRef) -> SimResult<()> {
        self.call_unit(Simcall::Join {
            target: target.id(),
            timeout: None,
        })
    }

    /// Block until `target` finishes or `timeout` seconds elapse.
    pub fn join_for(&mut self, target: &ActorRef, timeout: f64) -> SimResult<()> {
        self.call_unit(Simcall::Join {
            target: target.id(),
            timeout: Some(timeout),
        })
    }

    /// Move `target` to another host. Its running activities stay where
    /// they are.
    pub fn migrate(&mut self, target: &ActorRef, host: HostId) -> SimResult<()> {
        self.call_unit(Simcall::Migrate {
            target: target.id(),
            host,
        })
    }

    pub fn migrate_self(&mut self, host: HostId) -> SimResult<()> {
        let id = self.id;
        self.call_unit(Simcall::Migrate { target: id, host })
    }

    /// Kill `target` at `at` (or cancel a pending kill time with `None`).
    pub fn set_kill_time(&mut self, target: &ActorRef, at: Option<VirtualTime>) -> SimResult<()> {
        self.call_unit(Simcall::SetKillTime {
            target: target.id(),
            at,
        })
    }

    /// Become a daemon: killed once every non-daemon actor is gone.
    pub fn daemonize(&mut self) -> SimResult<()> {
        self.call_unit(Simcall::Daemonize)
    }

    pub fn set_auto_restart(&mut self, enabled: bool) -> SimResult<()> {
        self.call_unit(Simcall::SetAutoRestart(enabled))
    }

    pub fn is_alive(&mut self, target: &ActorRef) -> SimResult<bool> {
        self.call_bool(Simcall::IsAlive(target.id()))
    }

    // ── Exit handlers ─────────────────────────────────────────────────

    /// Run `handler` when this actor finishes. It gets `true` when the
    /// actor was killed or its body returned an error. Handlers run in
    /// reverse registration order, on the actor's own stack.
    pub fn on_exit<F>(&mut self, handler: F)
    where
        F: FnOnce(bool) + 'static,
    {
        self.exit_handlers.push(Box::new(handler));
    }

    pub(crate) fn run_exit_handlers(&mut self, failed: bool) {
        while let Some(handler) = self.exit_handlers.pop() {
            handler(failed);
        }
    }
}

impl std::fmt::Debug for Actor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Actor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("host", &self.host)
            .field("now", &self.now)
            .field("killed", &self.killed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityKind;
    use crate::context::Wakeup;

    /// Answers every simcall from a script, recording what was asked.
    struct Scripted {
        replies: std::collections::VecDeque<Signal>,
        asked: Vec<&'static str>,
        now: f64,
    }

    impl Scripted {
        fn new(replies: Vec<Signal>) -> Self {
            Scripted {
                replies: replies.into(),
                asked: Vec::new(),
                now: 0.0,
            }
        }
    }

    impl Transport for Scripted {
        fn suspend(&mut self, call: Simcall) -> Wakeup {
            self.asked.push(call.name());
            self.now += 1.0;
            Wakeup {
                now: VirtualTime::new(self.now),
                host: HostId::new(3),
                signal: self.replies.pop_front().unwrap_or(Signal::Terminate),
            }
        }
    }

    fn settled(result: SimResult<()>) -> Signal {
        Signal::Reply(Ok(Reply::Settled(Outcome {
            result,
            payload: None,
        })))
    }

    fn with_actor<R>(replies: Vec<Signal>, f: impl FnOnce(&mut Actor<'_>) -> R) -> (R, Vec<&'static str>) {
        let mut transport = Scripted::new(replies);
        let (tx, _rx) = crossbeam_channel::unbounded();
        let r = {
            let mut me = Actor::new(
                ActorId::new(7),
                Arc::from("t"),
                HostId::new(0),
                VirtualTime::ZERO,
                &mut transport,
                tx,
            );
            f(&mut me)
        };
        (r, transport.asked)
    }

    #[test]
    fn test_reply_updates_clock_and_host() {
        let ((), asked) = with_actor(vec![Signal::Reply(Ok(Reply::Unit))], |me| {
            me.sleep_for(2.0).unwrap();
            assert_eq!(me.now(), VirtualTime::new(1.0));
            assert_eq!(me.host(), HostId::new(3));
        });
        assert_eq!(asked, vec!["sleep"]);
    }

    #[test]
    fn test_terminate_is_sticky() {
        let (r, asked) = with_actor(vec![Signal::Terminate], |me| {
            let first = me.yield_now();
            let second = me.sleep_for(1.0);
            (first, second, me.is_killed())
        });
        assert_eq!(r, (Err(SimError::Terminated), Err(SimError::Terminated), true));
        // The second call never reached maestro.
        assert_eq!(asked, vec!["yield"]);
    }

    #[test]
    fn test_wait_caches_outcome() {
        let replies = vec![
            Signal::Reply(Ok(Reply::Activity(ActivityId::new(0, 0), ActivityKind::Exec))),
            settled(Err(SimError::HostFailure)),
        ];
        let (r, asked) = with_actor(replies, |me| {
            let mut exec = me.exec_async(1e6).unwrap();
            let first = me.wait(&mut exec);
            let again = me.wait(&mut exec);
            let tested = me.test(&mut exec);
            (first, again, tested)
        });
        assert_eq!(
            r,
            (
                Err(SimError::HostFailure),
                Err(SimError::HostFailure),
                Err(SimError::HostFailure)
            )
        );
        assert_eq!(asked, vec!["exec_start", "wait"]);
    }

    #[test]
    fn test_wait_any_asks_maestro_unless_first_is_cached() {
        let exec = |i| Signal::Reply(Ok(Reply::Activity(ActivityId::new(i, 0), ActivityKind::Exec)));
        let index = |i| {
            Signal::Reply(Ok(Reply::Index(
                i,
                Outcome {
                    result: Ok(()),
                    payload: None,
                },
            )))
        };
        let replies = vec![exec(0), exec(1), settled(Ok(())), index(0)];
        let (r, asked) = with_actor(replies, |me| {
            let mut pair = vec![me.exec_async(1.0).unwrap(), me.exec_async(1.0).unwrap()];
            me.wait(&mut pair[1]).unwrap();
            let any = me.wait_any(&mut pair);
            let polled = me.test_any(&mut pair);
            let cached = me.wait_any(&mut pair);
            (any, polled, cached)
        });
        assert_eq!(r, (Ok(0), Ok(Some(0)), Ok(0)));
        assert_eq!(asked, vec!["exec_start", "exec_start", "wait", "wait_any"]);
    }

    #[test]
    fn test_wait_timeout_is_not_cached() {
        let replies = vec![
            Signal::Reply(Ok(Reply::Activity(ActivityId::new(0, 0), ActivityKind::Exec))),
            Signal::Reply(Err(SimError::Timeout)),
            settled(Ok(())),
        ];
        let (r, _) = with_actor(replies, |me| {
            let mut exec = me.exec_async(1e6).unwrap();
            let first = me.wait_for(&mut exec, 0.5);
            let second = me.wait(&mut exec);
            (first, second)
        });
        assert_eq!(r, (Err(SimError::Timeout), Ok(())));
    }

    #[test]
    fn test_wait_all_surfaces_first_failure_in_list_order() {
        let replies = vec![
            Signal::Reply(Ok(Reply::Activity(ActivityId::new(0, 0), ActivityKind::Exec))),
            Signal::Reply(Ok(Reply::Activity(ActivityId::new(1, 0), ActivityKind::Exec))),
            Signal::Reply(Ok(Reply::Activity(ActivityId::new(2, 0), ActivityKind::Exec))),
            Signal::Reply(Ok(Reply::All(vec![
                Outcome {
                    result: Ok(()),
                    payload: None,
                },
                Outcome {
                    result: Err(SimError::TransferFailure),
                    payload: None,
                },
                Outcome {
                    result: Err(SimError::HostFailure),
                    payload: None,
                },
            ]))),
        ];
        let (r, _) = with_actor(replies, |me| {
            let mut list = vec![
                me.exec_async(1.0).unwrap(),
                me.exec_async(1.0).unwrap(),
                me.exec_async(1.0).unwrap(),
            ];
            let r = me.wait_all(&mut list);
            (r, list.iter().all(Activity::is_settled))
        });
        assert_eq!(r, (Err(SimError::TransferFailure), true));
    }

    #[test]
    fn test_wait_all_empty_is_immediate() {
        let (r, asked) = with_actor(vec![], |me| me.wait_all(&mut []));
        assert_eq!(r, Ok(()));
        assert!(asked.is_empty());
    }

    #[test]
    fn test_exit_handlers_run_lifo() {
        let order = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let ((), _) = with_actor(vec![], |me| {
            for i in 0..3 {
                let order = order.clone();
                me.on_exit(move |failed| order.borrow_mut().push((i, failed)));
            }
            me.run_exit_handlers(false);
        });
        assert_eq!(*order.borrow(), vec![(2, false), (1, false), (0, false)]);
    }

    #[test]
    fn test_get_takes_typed_payload() {
        let replies = vec![
            Signal::Reply(Ok(Reply::Activity(ActivityId::new(4, 1), ActivityKind::Comm))),
            Signal::Reply(Ok(Reply::Settled(Outcome {
                result: Ok(()),
                payload: Some(Box::new(String::from("hi"))),
            }))),
        ];
        let (r, asked) = with_actor(replies, |me| me.get::<String>("mbox"));
        assert_eq!(r, Ok("hi".to_string()));
        assert_eq!(asked, vec!["comm_start", "wait"]);
    }
}
