//! Stack-switching contexts on the calling thread.
//!
//! `corosensei` owns the only stack manipulation in the crate: it
//! allocates a guarded stack, saves the resumer's registers and jumps into
//! the coroutine, and back on `suspend`.

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use tracing::trace;

use super::{Context, ContextEntry, Signal, Transport, Wakeup, Yielded};
use crate::actor::{ActorId, ExitStatus};
use crate::simcall::Simcall;

struct CoroutineTransport<'y> {
    yielder: &'y Yielder<Wakeup, Simcall>,
}

impl Transport for CoroutineTransport<'_> {
    fn suspend(&mut self, call: Simcall) -> Wakeup {
        self.yielder.suspend(call)
    }
}

/// A context that runs on whichever thread resumes it. Not `Send`: it is
/// only ever driven by maestro's own thread.
pub(crate) struct CoroutineContext {
    actor: ActorId,
    coroutine: Coroutine<Wakeup, Simcall, ExitStatus, DefaultStack>,
    started: bool,
    finished: bool,
}

impl CoroutineContext {
    pub fn new(entry: ContextEntry) -> std::io::Result<Self> {
        let actor = entry.actor;
        let stack = DefaultStack::new(entry.stack_size)?;
        let coroutine = Coroutine::with_stack(stack, move |yielder: &Yielder<Wakeup, Simcall>, first: Wakeup| {
            let mut transport = CoroutineTransport { yielder };
            entry.enter(&mut transport, first)
        });
        Ok(CoroutineContext {
            actor,
            coroutine,
            started: false,
            finished: false,
        })
    }
}

impl Context for CoroutineContext {
    fn resume(&mut self, wakeup: Wakeup) -> Yielded {
        if self.finished {
            return Yielded::Exited(ExitStatus::Panicked(format!(
                "context of {} resumed after it finished",
                self.actor
            )));
        }
        self.started = true;
        trace!(actor = %self.actor, "switch into coroutine");
        match self.coroutine.resume(wakeup) {
            CoroutineResult::Yield(call) => Yielded::Simcall(call),
            CoroutineResult::Return(status) => {
                self.finished = true;
                Yielded::Exited(status)
            }
        }
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn has_started(&self) -> bool {
        self.started
    }
}

impl Drop for CoroutineContext {
    fn drop(&mut self) {
        // A suspended coroutine must unwind through its own code (exit
        // handlers, handle releases) before its stack is freed. After a
        // terminate every simcall fails without suspending, so one resume
        // normally finishes it.
        let mut attempts = 0;
        while self.started && !self.finished && attempts < 4 {
            attempts += 1;
            let wakeup = Wakeup {
                now: crate::time::VirtualTime::ZERO,
                host: crate::platform::HostId::new(0),
                signal: Signal::Terminate,
            };
            if let CoroutineResult::Return(_) = self.coroutine.resume(wakeup) {
                self.finished = true;
            }
        }
    }
}
