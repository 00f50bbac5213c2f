//! State-change hooks.
//!
//! Maestro emits a [`StateChange`] whenever an actor or an activity
//! changes state. Observers are called synchronously on maestro's thread,
//! in emission order, and cannot influence the simulation.

use crate::activity::{ActivityId, ActivityKind, Failure};
use crate::actor::{ActorId, ExitStatus};
use crate::platform::HostId;
use crate::time::VirtualTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum Subject {
    Actor(ActorId),
    Activity(ActivityId),
}

impl std::fmt::Display for Subject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Subject::Actor(id) => write!(f, "{}", id),
            Subject::Activity(id) => write!(f, "{}", id),
        }
    }
}

/// How an actor finished, without the details.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum ExitKind {
    Normal,
    Killed,
    Failed,
    Panicked,
}

impl From<&ExitStatus> for ExitKind {
    fn from(status: &ExitStatus) -> Self {
        match status {
            ExitStatus::Normal => ExitKind::Normal,
            ExitStatus::Killed => ExitKind::Killed,
            ExitStatus::Failed(_) => ExitKind::Failed,
            ExitStatus::Panicked(_) => ExitKind::Panicked,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum ChangeKind {
    ActorCreated { host: HostId },
    ActorSuspended,
    ActorResumed,
    ActorMigrated { to: HostId },
    ActorKilled,
    ActorFinished(ExitKind),
    ActivityCreated(ActivityKind),
    ActivityStarted,
    ActivitySuspended,
    ActivityResumed,
    ActivityDone,
    ActivityFailed(Failure),
    ActivityCanceled,
    ActivityDestroyed,
}

/// One hook emission: who changed, how, and when.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct StateChange {
    pub subject: Subject,
    pub kind: ChangeKind,
    pub at: VirtualTime,
}

impl std::fmt::Display for StateChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {} {:?}", self.at, self.subject, self.kind)
    }
}

/// Receives every state change. Must not block.
pub trait Observer {
    fn on_change(&mut self, change: &StateChange);
}

impl<F> Observer for F
where
    F: FnMut(&StateChange),
{
    fn on_change(&mut self, change: &StateChange) {
        self(change)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_observer() {
        let mut seen = Vec::new();
        {
            let mut obs = |c: &StateChange| seen.push(c.kind);
            let change = StateChange {
                subject: Subject::Actor(ActorId::new(1)),
                kind: ChangeKind::ActorSuspended,
                at: VirtualTime::ZERO,
            };
            obs.on_change(&change);
        }
        assert_eq!(seen, vec![ChangeKind::ActorSuspended]);
    }

    #[test]
    fn test_exit_kind_from_status() {
        assert_eq!(ExitKind::from(&ExitStatus::Killed), ExitKind::Killed);
        assert_eq!(
            ExitKind::from(&ExitStatus::Panicked("x".into())),
            ExitKind::Panicked
        );
    }

    #[test]
    fn test_display() {
        let change = StateChange {
            subject: Subject::Activity(ActivityId::new(3, 1)),
            kind: ChangeKind::ActivityDone,
            at: VirtualTime::new(2.0),
        };
        assert_eq!(change.to_string(), "[T=2] act3.1 ActivityDone");
    }
}
