//! Mutex simcalls and handing ownership over when an owner goes away.

use tracing::debug;

use super::{Blocker, Kernel, Schedule};
use crate::actor::ActorId;
use crate::error::{KernelError, KernelResult};
use crate::simcall::Reply;
use crate::sync::{KernelMutex, LockOutcome, MutexId, UnlockError};

impl Kernel {
    pub(crate) fn create_mutex(&mut self) -> MutexId {
        self.next_mutex += 1;
        let id = MutexId::new(self.next_mutex);
        self.mutexes.insert(id, KernelMutex::default());
        debug!(mutex = %id, "mutex created");
        id
    }

    fn mutex_mut(&mut self, caller: ActorId, id: MutexId) -> KernelResult<&mut KernelMutex> {
        if !self.mutexes.contains_key(&id) {
            return Err(KernelError::invalid_state(
                self.actor_name(caller),
                format!("{} is not a mutex", id),
            ));
        }
        self.mutexes
            .get_mut(&id)
            .ok_or_else(|| KernelError::invalid_state(caller.to_string(), "mutex vanished"))
    }

    pub(super) fn sc_mutex_lock(&mut self, caller: ActorId, id: MutexId) -> KernelResult<()> {
        match self.mutex_mut(caller, id)?.lock(caller) {
            LockOutcome::Acquired => {
                self.reply(caller, Ok(Reply::Unit));
                Ok(())
            }
            LockOutcome::Queued => {
                debug!(actor = %caller, mutex = %id, "waiting for mutex");
                if let Some(entry) = self.actors.get_mut(&caller) {
                    entry.state = Schedule::Blocked(Blocker::Mutex { mutex: id });
                }
                Ok(())
            }
            LockOutcome::Reentrant => Err(KernelError::invalid_state(
                self.actor_name(caller),
                format!("locked {} twice", id),
            )),
        }
    }

    pub(super) fn sc_mutex_try_lock(&mut self, caller: ActorId, id: MutexId) -> KernelResult<()> {
        let acquired = self.mutex_mut(caller, id)?.try_lock(caller);
        self.reply(caller, Ok(Reply::Bool(acquired)));
        Ok(())
    }

    pub(super) fn sc_mutex_unlock(&mut self, caller: ActorId, id: MutexId) -> KernelResult<()> {
        match self.mutex_mut(caller, id)?.unlock(caller) {
            Ok(next) => {
                self.reply(caller, Ok(Reply::Unit));
                if let Some(next) = next {
                    self.grant_mutex(id, next);
                }
                Ok(())
            }
            Err(UnlockError::NotLocked) => Err(KernelError::invalid_state(
                self.actor_name(caller),
                format!("unlocked {} while it is free", id),
            )),
            Err(UnlockError::NotOwner(owner)) => Err(KernelError::invalid_state(
                self.actor_name(caller),
                format!("unlocked {} owned by {}", id, owner),
            )),
        }
    }

    /// `next` was queued on `id` and owns it now.
    fn grant_mutex(&mut self, id: MutexId, next: ActorId) {
        debug!(mutex = %id, owner = %next, "mutex handed over");
        self.reply(next, Ok(Reply::Unit));
    }

    /// Release every mutex `actor` still owns.
    pub(super) fn release_mutexes(&mut self, actor: ActorId) {
        let held: Vec<MutexId> = self
            .mutexes
            .iter()
            .filter(|(_, m)| m.owner() == Some(actor))
            .map(|(id, _)| *id)
            .collect();
        for id in held {
            let next = self
                .mutexes
                .get_mut(&id)
                .and_then(|m| m.unlock(actor).ok())
                .flatten();
            debug!(mutex = %id, %actor, "owner gone, mutex released");
            if let Some(next) = next {
                self.grant_mutex(id, next);
            }
        }
    }

    pub(super) fn forget_mutex_sleeper(&mut self, actor: ActorId, id: MutexId) {
        if let Some(m) = self.mutexes.get_mut(&id) {
            m.forget(actor);
        }
    }
}
