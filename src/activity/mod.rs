//! Activities: asynchronous communications and executions.
//!
//! Every activity lives in the kernel's [`ActivityArena`](arena::ActivityArena)
//! and is referred to by an [`ActivityId`]. Actors hold [`Activity`]
//! handles; mailboxes and the resource model hold plain ids. A record is
//! freed only when maestro's end-of-round sweep finds its handle count at
//! zero.
//!
//! ```text
//!            start            model completion
//!   Init ──────────► Started ──────────────────► Done
//!     │                 │     host / link loss
//!     │                 ├──────────────────────► Failed(Host | Transfer | Timeout)
//!     │  cancel         │     cancel / kill
//!     └─────────────────┴──────────────────────► Canceled
//! ```

pub(crate) mod arena;
mod handle;

pub use handle::Activity;

use std::any::Any;
use std::sync::Arc;

use crate::actor::ActorId;
use crate::error::{SimError, SimResult};
use crate::mailbox::CommSide;
use crate::model::ResourceHandle;
use crate::platform::HostId;
use crate::time::VirtualTime;

/// Data carried by a communication.
pub type Payload = Box<dyn Any + Send>;

// ── ActivityId ────────────────────────────────────────────────────────

/// Arena handle: slot index plus the generation of that slot.
///
/// A slot is reused after its record is freed, with a bumped generation,
/// so a stale id can never alias a newer activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct ActivityId {
    index: u32,
    generation: u32,
}

impl ActivityId {
    #[inline]
    pub fn new(index: u32, generation: u32) -> Self {
        ActivityId { index, generation }
    }

    #[inline]
    pub fn index(self) -> u32 {
        self.index
    }

    #[inline]
    pub fn generation(self) -> u32 {
        self.generation
    }

    /// Stable 64-bit encoding, used when hashing change logs.
    #[inline]
    pub fn raw(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }
}

impl std::fmt::Display for ActivityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "act{}.{}", self.index, self.generation)
    }
}

// ── Kind & state ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum ActivityKind {
    Comm,
    Exec,
}

impl std::fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActivityKind::Comm => write!(f, "comm"),
            ActivityKind::Exec => write!(f, "exec"),
        }
    }
}

/// Why an activity failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum Failure {
    /// A host involved was turned off.
    Host,
    /// A link on the route failed.
    Transfer,
    /// The activity's own deadline elapsed.
    Timeout,
}

impl From<Failure> for SimError {
    fn from(f: Failure) -> Self {
        match f {
            Failure::Host => SimError::HostFailure,
            Failure::Transfer => SimError::TransferFailure,
            Failure::Timeout => SimError::Timeout,
        }
    }
}

/// Lifecycle of an activity. Terminal states are sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum ActivityState {
    Init,
    Started,
    Done,
    Failed(Failure),
    Canceled,
}

impl ActivityState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ActivityState::Done | ActivityState::Failed(_) | ActivityState::Canceled
        )
    }

    /// Whether `self → next` is a legal (monotonic) transition.
    pub fn can_transition_to(self, next: ActivityState) -> bool {
        match (self, next) {
            (ActivityState::Init, ActivityState::Started) => true,
            (ActivityState::Init | ActivityState::Started, n) => n.is_terminal(),
            _ => false,
        }
    }

    /// What a waiter observes, once terminal.
    pub fn outcome(self) -> Option<SimResult<()>> {
        match self {
            ActivityState::Init | ActivityState::Started => None,
            ActivityState::Done => Some(Ok(())),
            ActivityState::Failed(f) => Some(Err(f.into())),
            ActivityState::Canceled => Some(Err(SimError::OperationCanceled)),
        }
    }
}

impl std::fmt::Display for ActivityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActivityState::Init => write!(f, "init"),
            ActivityState::Started => write!(f, "started"),
            ActivityState::Done => write!(f, "done"),
            ActivityState::Failed(why) => write!(f, "failed({:?})", why),
            ActivityState::Canceled => write!(f, "canceled"),
        }
    }
}

// ── Kernel-side records ───────────────────────────────────────────────

/// Where a communication sits in its mailbox, if anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Queued {
    No,
    /// Unmatched, in the rendezvous queue.
    Pending,
    /// Started early for a permanent receiver, not yet claimed.
    Eager,
}

pub(crate) struct CommRecord {
    pub mailbox: Arc<str>,
    pub sender: Option<ActorId>,
    pub receiver: Option<ActorId>,
    pub src_host: Option<HostId>,
    pub dst_host: Option<HostId>,
    pub bytes: f64,
    pub rate: Option<f64>,
    pub payload: Option<Payload>,
    pub queued: Queued,
}

impl CommRecord {
    /// The side that created this descriptor while it is still unmatched.
    pub fn open_side(&self) -> Option<CommSide> {
        match (self.sender, self.receiver) {
            (Some(_), None) => Some(CommSide::Send),
            (None, Some(_)) => Some(CommSide::Recv),
            _ => None,
        }
    }
}

pub(crate) struct ExecRecord {
    pub hosts: Vec<HostId>,
    pub flops: f64,
    pub priority: f64,
    pub bound: Option<f64>,
}

pub(crate) enum ActivityDetail {
    Comm(CommRecord),
    Exec(ExecRecord),
}

/// One activity as maestro sees it.
pub(crate) struct ActivityRecord {
    pub id: ActivityId,
    pub state: ActivityState,
    pub detail: ActivityDetail,
    /// Actors blocked in a wait that includes this activity, in arrival order.
    pub waiters: Vec<ActorId>,
    /// Initiators. Killing one of them cancels the activity.
    pub owners: Vec<ActorId>,
    /// Fire-and-forget: nobody is told about its outcome.
    pub detached: bool,
    /// Frozen by `suspend`: the model makes no progress on it.
    pub suspended: bool,
    pub resource: Option<ResourceHandle>,
    pub deadline: Option<VirtualTime>,
    /// Outstanding handles: user handles, mailbox queue, model attachment.
    pub refs: u32,
    pub created_at: VirtualTime,
    pub finished_at: Option<VirtualTime>,
}

impl ActivityRecord {
    pub fn new(id: ActivityId, detail: ActivityDetail, now: VirtualTime) -> Self {
        ActivityRecord {
            id,
            state: ActivityState::Init,
            detail,
            waiters: Vec::new(),
            owners: Vec::new(),
            detached: false,
            suspended: false,
            resource: None,
            deadline: None,
            refs: 0,
            created_at: now,
            finished_at: None,
        }
    }

    pub fn kind(&self) -> ActivityKind {
        match self.detail {
            ActivityDetail::Comm(_) => ActivityKind::Comm,
            ActivityDetail::Exec(_) => ActivityKind::Exec,
        }
    }

    pub fn comm(&self) -> Option<&CommRecord> {
        match &self.detail {
            ActivityDetail::Comm(c) => Some(c),
            ActivityDetail::Exec(_) => None,
        }
    }

    pub fn comm_mut(&mut self) -> Option<&mut CommRecord> {
        match &mut self.detail {
            ActivityDetail::Comm(c) => Some(c),
            ActivityDetail::Exec(_) => None,
        }
    }

    /// Move to `next`, refusing any non-monotonic step.
    pub fn transition(&mut self, next: ActivityState, now: VirtualTime) -> Result<(), ActivityState> {
        if !self.state.can_transition_to(next) {
            return Err(self.state);
        }
        self.state = next;
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        Ok(())
    }
}

// ── Specs (actor-side requests) ───────────────────────────────────────

/// Parameters of an execution to start.
///
/// ```rust
/// use simkernel::ExecSpec;
///
/// let spec = ExecSpec::new(1e9).priority(2.0).bound(5e8).timeout(10.0);
/// assert_eq!(spec.flops(), 1e9);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ExecSpec {
    pub(crate) flops: f64,
    pub(crate) hosts: Vec<HostId>,
    pub(crate) priority: f64,
    pub(crate) bound: Option<f64>,
    pub(crate) timeout: Option<f64>,
}

impl ExecSpec {
    /// An execution of `flops` on the caller's host.
    pub fn new(flops: f64) -> Self {
        ExecSpec {
            flops,
            hosts: Vec::new(),
            priority: 1.0,
            bound: None,
            timeout: None,
        }
    }

    /// Run on `host` instead of the caller's host.
    pub fn on_host(mut self, host: HostId) -> Self {
        self.hosts = vec![host];
        self
    }

    /// Run on several hosts at once (parallel task).
    pub fn on_hosts(mut self, hosts: &[HostId]) -> Self {
        self.hosts = hosts.to_vec();
        self
    }

    pub fn priority(mut self, priority: f64) -> Self {
        self.priority = priority;
        self
    }

    /// Cap the flop rate.
    pub fn bound(mut self, bound: f64) -> Self {
        self.bound = Some(bound);
        self
    }

    /// Fail the activity with `Timeout` if it is still running after
    /// `secs` seconds.
    pub fn timeout(mut self, secs: f64) -> Self {
        self.timeout = Some(secs);
        self
    }

    pub fn flops(&self) -> f64 {
        self.flops
    }
}

pub(crate) enum CommRole {
    Put { payload: Payload, bytes: f64 },
    Get,
}

/// One side of a communication to start on a mailbox.
pub struct CommSpec {
    pub(crate) mailbox: String,
    pub(crate) role: CommRole,
    pub(crate) rate: Option<f64>,
    pub(crate) timeout: Option<f64>,
}

impl CommSpec {
    /// Send `payload`, accounted as `bytes` on the wire.
    pub fn put<T: Any + Send>(mailbox: &str, payload: T, bytes: f64) -> Self {
        CommSpec {
            mailbox: mailbox.to_string(),
            role: CommRole::Put {
                payload: Box::new(payload),
                bytes,
            },
            rate: None,
            timeout: None,
        }
    }

    /// Receive from `mailbox`.
    pub fn get(mailbox: &str) -> Self {
        CommSpec {
            mailbox: mailbox.to_string(),
            role: CommRole::Get,
            rate: None,
            timeout: None,
        }
    }

    /// Cap the transfer rate (bytes/s).
    pub fn rate(mut self, rate: f64) -> Self {
        self.rate = Some(rate);
        self
    }

    /// Fail the communication with `Timeout` if it has not completed
    /// `secs` seconds after being issued.
    pub fn timeout(mut self, secs: f64) -> Self {
        self.timeout = Some(secs);
        self
    }

    pub fn mailbox(&self) -> &str {
        &self.mailbox
    }

    pub fn side(&self) -> CommSide {
        match self.role {
            CommRole::Put { .. } => CommSide::Send,
            CommRole::Get => CommSide::Recv,
        }
    }
}

impl std::fmt::Debug for CommSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommSpec")
            .field("mailbox", &self.mailbox)
            .field("side", &self.side())
            .field("rate", &self.rate)
            .field("timeout", &self.timeout)
            .finish()
    }
}
