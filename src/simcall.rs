//! Requests from actor contexts to maestro, and maestro's answers.
//!
//! Actor code never touches kernel state. Each blocking primitive turns
//! into one [`Simcall`]; the context suspends with it, and maestro resumes
//! the context later with a [`Reply`] (or with the terminate signal).
//! Because only maestro applies simcalls, and it does so in ready-list
//! order, the serial and parallel factories produce the same outcome.

use crate::activity::{ActivityId, ActivityKind, CommSpec, ExecSpec, Payload};
use crate::actor::{ActorId, ActorRef, ActorSpec};
use crate::error::{SimError, SimResult};
use crate::platform::HostId;
use crate::sync::MutexId;
use crate::time::VirtualTime;

/// Read-only questions about one mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MailboxQuery {
    /// Nothing is queued at all.
    Empty,
    /// The oldest queued communication already completed.
    Ready,
    /// Sender of the oldest queued communication.
    ListenFrom,
    /// The permanent receiver, if bound.
    Receiver,
}

pub(crate) enum Simcall {
    // ── actor control ──
    Spawn(ActorSpec),
    Kill(ActorId),
    KillAll,
    Suspend(ActorId),
    Resume(ActorId),
    Join {
        target: ActorId,
        timeout: Option<f64>,
    },
    Migrate {
        target: ActorId,
        host: HostId,
    },
    SetKillTime {
        target: ActorId,
        at: Option<VirtualTime>,
    },
    Daemonize,
    SetAutoRestart(bool),
    IsAlive(ActorId),
    Yield,
    Sleep(f64),

    // ── activities ──
    ExecStart(ExecSpec),
    CommStart {
        spec: CommSpec,
        detached: bool,
    },
    Test(ActivityId),
    TestAny(Vec<ActivityId>),
    Wait {
        activity: ActivityId,
        timeout: Option<f64>,
    },
    WaitAny {
        activities: Vec<ActivityId>,
        timeout: Option<f64>,
    },
    WaitAll {
        activities: Vec<ActivityId>,
        timeout: Option<f64>,
    },
    Cancel(ActivityId),
    ActivitySuspend(ActivityId),
    ActivityResume(ActivityId),

    // ── mutexes ──
    MutexCreate,
    MutexLock(MutexId),
    MutexTryLock(MutexId),
    MutexUnlock(MutexId),

    // ── mailboxes ──
    MailboxFront(String),
    MailboxListen(String),
    MailboxSetReceiver {
        mailbox: String,
        receiver: Option<ActorId>,
    },
    MailboxQuery {
        mailbox: String,
        query: MailboxQuery,
    },
}

impl Simcall {
    pub fn name(&self) -> &'static str {
        match self {
            Simcall::Spawn(_) => "spawn",
            Simcall::Kill(_) => "kill",
            Simcall::KillAll => "kill_all",
            Simcall::Suspend(_) => "suspend",
            Simcall::Resume(_) => "resume",
            Simcall::Join { .. } => "join",
            Simcall::Migrate { .. } => "migrate",
            Simcall::SetKillTime { .. } => "set_kill_time",
            Simcall::Daemonize => "daemonize",
            Simcall::SetAutoRestart(_) => "set_auto_restart",
            Simcall::IsAlive(_) => "is_alive",
            Simcall::Yield => "yield",
            Simcall::Sleep(_) => "sleep",
            Simcall::ExecStart(_) => "exec_start",
            Simcall::CommStart { .. } => "comm_start",
            Simcall::Test(_) => "test",
            Simcall::TestAny(_) => "test_any",
            Simcall::Wait { .. } => "wait",
            Simcall::WaitAny { .. } => "wait_any",
            Simcall::WaitAll { .. } => "wait_all",
            Simcall::Cancel(_) => "cancel",
            Simcall::ActivitySuspend(_) => "activity_suspend",
            Simcall::ActivityResume(_) => "activity_resume",
            Simcall::MutexCreate => "mutex_create",
            Simcall::MutexLock(_) => "mutex_lock",
            Simcall::MutexTryLock(_) => "mutex_try_lock",
            Simcall::MutexUnlock(_) => "mutex_unlock",
            Simcall::MailboxFront(_) => "mailbox_front",
            Simcall::MailboxListen(_) => "mailbox_listen",
            Simcall::MailboxSetReceiver { .. } => "mailbox_set_receiver",
            Simcall::MailboxQuery { query, .. } => match query {
                MailboxQuery::Empty => "mailbox_empty",
                MailboxQuery::Ready => "mailbox_ready",
                MailboxQuery::ListenFrom => "mailbox_listen_from",
                MailboxQuery::Receiver => "mailbox_receiver",
            },
        }
    }
}

/// The terminal outcome of one activity, as delivered to one waiter.
/// The payload is only present for the receiver of a completed comm,
/// and only the first time it is collected.
pub(crate) struct Outcome {
    pub result: SimResult<()>,
    pub payload: Option<Payload>,
}

pub(crate) enum Reply {
    Unit,
    Bool(bool),
    Spawned(ActorRef),
    Actor(Option<ActorId>),
    Mutex(MutexId),
    /// A new handle on an activity.
    Activity(ActivityId, ActivityKind),
    /// A new observer handle from a mailbox peek, if there was anything.
    Peeked(Option<(ActivityId, ActivityKind)>),
    /// A test found the activity still running.
    Pending,
    Settled(Outcome),
    Index(usize, Outcome),
    All(Vec<Outcome>),
}

impl Reply {
    /// The activity for which this reply carries a counted handle.
    pub fn held_activity(&self) -> Option<ActivityId> {
        match self {
            Reply::Activity(id, _) | Reply::Peeked(Some((id, _))) => Some(*id),
            _ => None,
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Reply::Unit => "unit",
            Reply::Bool(_) => "bool",
            Reply::Spawned(_) => "spawned",
            Reply::Actor(_) => "actor",
            Reply::Mutex(_) => "mutex",
            Reply::Activity(..) => "activity",
            Reply::Peeked(_) => "peeked",
            Reply::Pending => "pending",
            Reply::Settled(_) => "settled",
            Reply::Index(..) => "index",
            Reply::All(_) => "all",
        }
    }
}

pub(crate) type SimcallResult = Result<Reply, SimError>;
