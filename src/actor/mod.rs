//! Actors: simulated processes.
//!
//! An actor is a body (a closure) running on its own [`Context`](crate::context).
//! Inside the body the actor talks to the simulation through [`Actor`];
//! other actors refer to it through a weak [`ActorRef`].

mod api;

pub use api::Actor;

use std::sync::Arc;

use crate::error::{SimError, SimResult};
use crate::platform::HostId;
use crate::time::VirtualTime;

// ── ActorId ───────────────────────────────────────────────────────────

/// Process id. Ids start at 1 and are never reused within a simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct ActorId(u64);

impl ActorId {
    #[inline]
    pub fn new(raw: u64) -> Self {
        ActorId(raw)
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ActorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "A{}", self.0)
    }
}

// ── ActorRef ──────────────────────────────────────────────────────────

/// A weak reference to an actor, used for control operations
/// (kill, join, suspend, migrate...). Holding one does not keep the
/// actor alive; operations on a finished actor are no-ops.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ActorRef {
    id: ActorId,
    name: Arc<str>,
}

impl ActorRef {
    pub(crate) fn new(id: ActorId, name: Arc<str>) -> Self {
        ActorRef { id, name }
    }

    pub fn id(&self) -> ActorId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Display for ActorRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "'{}' ({})", self.name, self.id)
    }
}

// ── Spawning ──────────────────────────────────────────────────────────

/// The code an actor runs. Shared so that auto-restart can run it again.
pub type ActorBody = Arc<dyn Fn(&mut Actor<'_>) -> SimResult<()> + Send + Sync>;

/// Everything needed to spawn an actor.
///
/// ```rust
/// use simkernel::{ActorSpec, HostId};
///
/// let spec = ActorSpec::new("worker", HostId::new(0), |me| me.sleep_for(1.0))
///     .daemon()
///     .stack_size(64 * 1024);
/// assert_eq!(spec.name(), "worker");
/// ```
#[derive(Clone)]
pub struct ActorSpec {
    pub(crate) name: String,
    pub(crate) host: HostId,
    pub(crate) body: ActorBody,
    pub(crate) daemon: bool,
    pub(crate) auto_restart: bool,
    pub(crate) kill_at: Option<VirtualTime>,
    pub(crate) stack_size: Option<usize>,
}

impl ActorSpec {
    pub fn new<F>(name: &str, host: HostId, body: F) -> Self
    where
        F: Fn(&mut Actor<'_>) -> SimResult<()> + Send + Sync + 'static,
    {
        Self::from_body(name, host, Arc::new(body))
    }

    pub fn from_body(name: &str, host: HostId, body: ActorBody) -> Self {
        ActorSpec {
            name: name.to_string(),
            host,
            body,
            daemon: false,
            auto_restart: false,
            kill_at: None,
            stack_size: None,
        }
    }

    /// Killed automatically once every non-daemon actor has finished.
    pub fn daemon(mut self) -> Self {
        self.daemon = true;
        self
    }

    /// Spawned again when its host comes back after being turned off.
    pub fn auto_restart(mut self) -> Self {
        self.auto_restart = true;
        self
    }

    /// Kill the actor at `at`.
    pub fn kill_at(mut self, at: VirtualTime) -> Self {
        self.kill_at = Some(at);
        self
    }

    /// Override the configured context stack size for this actor.
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> HostId {
        self.host
    }
}

impl std::fmt::Debug for ActorSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorSpec")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("daemon", &self.daemon)
            .field("auto_restart", &self.auto_restart)
            .field("kill_at", &self.kill_at)
            .field("stack_size", &self.stack_size)
            .finish()
    }
}

// ── Exit status ───────────────────────────────────────────────────────

/// How an actor's context finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitStatus {
    /// The body returned `Ok(())`.
    Normal,
    /// The actor was killed and unwound.
    Killed,
    /// The body returned a simulated-world error it did not handle.
    Failed(SimError),
    /// The body panicked. Fatal to the run.
    Panicked(String),
}

impl ExitStatus {
    pub fn is_normal(&self) -> bool {
        matches!(self, ExitStatus::Normal)
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitStatus::Normal => write!(f, "exited"),
            ExitStatus::Killed => write!(f, "killed"),
            ExitStatus::Failed(e) => write!(f, "failed ({})", e),
            ExitStatus::Panicked(msg) => write!(f, "panicked ({})", msg),
        }
    }
}
