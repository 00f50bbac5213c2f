//! Simulated mutexes.
//!
//! A mutex is owned by at most one actor. Actors that try to lock it while
//! it is held queue up in arrival order, and `unlock` hands ownership
//! straight to the oldest of them.

use std::collections::VecDeque;

use crate::actor::ActorId;

/// Handle on a kernel mutex. Cheap to copy and to move between actors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct MutexId(u64);

impl MutexId {
    #[inline]
    pub(crate) fn new(raw: u64) -> Self {
        MutexId(raw)
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for MutexId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "M{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockOutcome {
    Acquired,
    /// Held by someone else; the caller is now queued.
    Queued,
    /// The caller already owns it.
    Reentrant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnlockError {
    NotLocked,
    NotOwner(ActorId),
}

/// Ownership and the queue of actors blocked in `lock`.
#[derive(Debug, Default)]
pub(crate) struct KernelMutex {
    owner: Option<ActorId>,
    sleepers: VecDeque<ActorId>,
}

impl KernelMutex {
    pub fn owner(&self) -> Option<ActorId> {
        self.owner
    }

    pub fn sleepers(&self) -> usize {
        self.sleepers.len()
    }

    pub fn lock(&mut self, actor: ActorId) -> LockOutcome {
        match self.owner {
            None => {
                self.owner = Some(actor);
                LockOutcome::Acquired
            }
            Some(owner) if owner == actor => LockOutcome::Reentrant,
            Some(_) => {
                self.sleepers.push_back(actor);
                LockOutcome::Queued
            }
        }
    }

    pub fn try_lock(&mut self, actor: ActorId) -> bool {
        if self.owner.is_some() {
            return false;
        }
        self.owner = Some(actor);
        true
    }

    /// Release the mutex held by `actor`. Returns the sleeper that now
    /// owns it, if any.
    pub fn unlock(&mut self, actor: ActorId) -> Result<Option<ActorId>, UnlockError> {
        match self.owner {
            None => Err(UnlockError::NotLocked),
            Some(owner) if owner != actor => Err(UnlockError::NotOwner(owner)),
            Some(_) => {
                self.owner = self.sleepers.pop_front();
                Ok(self.owner)
            }
        }
    }

    /// Drop `actor` from the sleeper queue.
    pub fn forget(&mut self, actor: ActorId) {
        self.sleepers.retain(|s| *s != actor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn a(i: u64) -> ActorId {
        ActorId::new(i)
    }

    #[test]
    fn test_lock_then_unlock() {
        let mut m = KernelMutex::default();
        assert_eq!(m.lock(a(1)), LockOutcome::Acquired);
        assert_eq!(m.owner(), Some(a(1)));
        assert_eq!(m.lock(a(1)), LockOutcome::Reentrant);
        assert_eq!(m.unlock(a(1)), Ok(None));
        assert_eq!(m.owner(), None);
        assert_eq!(m.unlock(a(1)), Err(UnlockError::NotLocked));
    }

    #[test]
    fn test_ownership_passes_in_arrival_order() {
        let mut m = KernelMutex::default();
        m.lock(a(1));
        assert_eq!(m.lock(a(2)), LockOutcome::Queued);
        assert_eq!(m.lock(a(3)), LockOutcome::Queued);
        assert_eq!(m.sleepers(), 2);
        assert_eq!(m.unlock(a(2)), Err(UnlockError::NotOwner(a(1))));
        assert_eq!(m.unlock(a(1)), Ok(Some(a(2))));
        assert_eq!(m.unlock(a(2)), Ok(Some(a(3))));
        assert_eq!(m.unlock(a(3)), Ok(None));
    }

    #[test]
    fn test_try_lock_never_queues() {
        let mut m = KernelMutex::default();
        assert!(m.try_lock(a(1)));
        assert!(!m.try_lock(a(2)));
        assert!(!m.try_lock(a(1)));
        assert_eq!(m.sleepers(), 0);
    }

    #[test]
    fn test_forgotten_sleeper_is_skipped() {
        let mut m = KernelMutex::default();
        m.lock(a(1));
        m.lock(a(2));
        m.lock(a(3));
        m.forget(a(2));
        assert_eq!(m.unlock(a(1)), Ok(Some(a(3))));
    }
}
