//! The resource-model boundary.
//!
//! The kernel never decides how long an execution or a transfer takes.
//! When an activity starts, maestro turns it into a [`Demand`] and hands
//! it to a [`ResourceModel`]. The model answers one question during the
//! clock-advance step: when does the next thing finish, and what finished.
//!
//! [`LinearModel`] is a small reference implementation without
//! contention, useful for tests and demos.

mod linear;
mod rng;

pub use linear::{LinearModel, ModelConfig};
pub use rng::DeterministicRng;

use crate::activity::{ActivityId, Failure};
use crate::platform::{HostId, LinkRef};
use crate::time::VirtualTime;

/// Opaque handle the model returns for an attached activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceHandle(u64);

impl ResourceHandle {
    #[inline]
    pub fn new(raw: u64) -> Self {
        ResourceHandle(raw)
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "R{}", self.0)
    }
}

/// What an activity asks of the platform's resources.
#[derive(Debug, Clone, PartialEq)]
pub enum Demand {
    /// An execution of `flops` on every listed host `(host, speed)`.
    Compute {
        hosts: Vec<(HostId, f64)>,
        flops: f64,
        /// Sharing weight. Only meaningful for contention models.
        priority: f64,
        /// Upper bound on the flop rate, if any.
        bound: Option<f64>,
    },

    /// A transfer of `bytes` from `src` to `dst` along `route`.
    Transfer {
        src: HostId,
        dst: HostId,
        route: Vec<LinkRef>,
        bytes: f64,
        /// Upper bound on the byte rate, if any.
        rate: Option<f64>,
    },
}

impl Demand {
    /// Every host the demand depends on.
    pub fn hosts(&self) -> Vec<HostId> {
        match self {
            Demand::Compute { hosts, .. } => hosts.iter().map(|(h, _)| *h).collect(),
            Demand::Transfer { src, dst, .. } => vec![*src, *dst],
        }
    }
}

/// One finished (or failed) attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub handle: ResourceHandle,
    pub outcome: Result<(), Failure>,
}

/// A change of host availability the kernel must react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    TurnedOff(HostId),
    TurnedOn(HostId),
}

/// The contention / speed model consumed by maestro.
///
/// Call order per clock advance: `next_completion_time`, `advance_to`,
/// `poll_completed`, `poll_host_events`. Implementations must be
/// deterministic: the same sequence of calls yields the same answers.
pub trait ResourceModel: Send {
    /// Start tracking `demand` for `activity` at virtual time `now`.
    fn attach(&mut self, activity: ActivityId, demand: Demand, now: VirtualTime) -> ResourceHandle;

    /// Stop tracking an attachment (completion consumed, or canceled).
    /// Unknown handles are ignored.
    fn detach(&mut self, handle: ResourceHandle);

    /// Freeze an attachment at `now`: it makes no progress and does not
    /// complete until resumed. It can still fail. Suspending twice is a
    /// no-op.
    fn suspend(&mut self, handle: ResourceHandle, now: VirtualTime);

    /// Let a suspended attachment progress again from `now`, with the work
    /// it had left when suspended.
    fn resume(&mut self, handle: ResourceHandle, now: VirtualTime);

    /// The next instant at which something tracked by the model changes.
    fn next_completion_time(&self) -> Option<VirtualTime>;

    /// Move the model's clock to `now`.
    fn advance_to(&mut self, now: VirtualTime);

    /// Attachments that finished or failed up to the current clock, in the
    /// order they happened.
    fn poll_completed(&mut self) -> Vec<Completion>;

    /// Host availability changes up to the current clock.
    fn poll_host_events(&mut self) -> Vec<HostEvent> {
        Vec::new()
    }

    /// Whether `host` is currently usable.
    fn is_host_on(&self, host: HostId) -> bool {
        let _ = host;
        true
    }
}
