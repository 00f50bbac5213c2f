//! Execution contexts and the factories that run them.
//!
//! A context is one independent stack running one actor body. The kernel
//! only ever does two things with it: resume it with a [`Wakeup`], and get
//! back what it yielded (a simcall, or its exit status).
//!
//! ```text
//!   maestro                            actor context
//!   ───────                            ─────────────
//!   resume(Wakeup::Start) ───────────► trampoline → body(&mut Actor)
//!                                         │ me.wait(&mut comm)
//!        Yielded::Simcall(Wait) ◄─────────┘ suspend
//!   ...apply, advance clock...
//!   resume(Reply(Settled)) ──────────► returns from wait()
//!                                         │ body returns
//!        Yielded::Exited(Normal) ◄────────┘ finished, never resumed again
//! ```
//!
//! Two backends exist. [`CoroutineContext`] switches stacks on the
//! calling thread with `corosensei`. [`ThreadContext`] parks a dedicated
//! OS thread between turns and hands control back and forth over
//! rendezvous channels, so any thread may resume it. Factories pick the
//! backend and decide how a batch of ready contexts is run.

mod coroutine;
mod parallel;
mod serial;
mod thread;

pub(crate) use coroutine::CoroutineContext;
pub(crate) use parallel::ParallelFactory;
pub(crate) use serial::SerialFactory;
pub(crate) use thread::{ContextLink, ThreadContext};

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crossbeam_channel::Sender;
use tracing::trace;

use crate::activity::ActivityId;
use crate::actor::{Actor, ActorBody, ActorId, ExitStatus};
use crate::config::{ContextBackend, FactoryKind, SimConfig};
use crate::platform::HostId;
use crate::simcall::{Simcall, SimcallResult};
use crate::time::VirtualTime;

// ── Hand-off vocabulary ───────────────────────────────────────────────

/// What maestro passes to a context when it resumes it.
pub(crate) struct Wakeup {
    pub now: VirtualTime,
    pub host: HostId,
    pub signal: Signal,
}

pub(crate) enum Signal {
    /// First resume: run the body.
    Start,
    /// Answer to the simcall the context suspended with.
    Reply(SimcallResult),
    /// The actor was killed: unwind and finish.
    Terminate,
}

impl Signal {
    pub fn is_terminate(&self) -> bool {
        matches!(self, Signal::Terminate)
    }
}

/// What a context hands back when it suspends.
pub(crate) enum Yielded {
    Simcall(Simcall),
    Exited(ExitStatus),
}

/// The actor side of a suspension: give maestro a simcall and block until
/// it resumes this context.
pub(crate) trait Transport {
    fn suspend(&mut self, call: Simcall) -> Wakeup;
}

// ── Context & factory ─────────────────────────────────────────────────

/// One actor's stack.
pub(crate) trait Context {
    /// Run the actor until its next suspension point.
    fn resume(&mut self, wakeup: Wakeup) -> Yielded;

    /// Whether the body has finished. A finished context is never resumed.
    fn is_finished(&self) -> bool;

    /// Whether the context has been resumed at least once.
    fn has_started(&self) -> bool;

    /// A `Send` resume handle, for contexts another thread may drive.
    fn link(&self) -> Option<ContextLink> {
        None
    }
}

/// Everything a new context needs to run its actor.
pub(crate) struct ContextEntry {
    pub actor: ActorId,
    pub name: Arc<str>,
    pub body: ActorBody,
    pub releases: Sender<ActivityId>,
    pub stack_size: usize,
}

impl ContextEntry {
    /// The trampoline every backend runs on its fresh stack.
    ///
    /// A context killed before its first turn finishes without running the
    /// body. Otherwise the body runs, exit handlers run (also after a kill),
    /// and the exit status is returned as the context's final yield.
    pub fn enter(self, transport: &mut dyn Transport, first: Wakeup) -> ExitStatus {
        let ContextEntry {
            actor,
            name,
            body,
            releases,
            ..
        } = self;
        if first.signal.is_terminate() {
            trace!(%actor, "killed before its first turn");
            return ExitStatus::Killed;
        }

        let mut me = Actor::new(actor, name, first.host, first.now, transport, releases);
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let result = body(&mut me);
            let failed = me.is_killed() || result.is_err();
            me.run_exit_handlers(failed);
            result
        }));

        match result {
            Err(payload) => ExitStatus::Panicked(panic_message(payload.as_ref())),
            Ok(_) if me.is_killed() => ExitStatus::Killed,
            Ok(Ok(())) => ExitStatus::Normal,
            Ok(Err(e)) => ExitStatus::Failed(e),
        }
    }
}

/// One entry of a scheduling pass.
pub(crate) struct Dispatch<'a> {
    pub actor: ActorId,
    pub context: &'a mut dyn Context,
    pub wakeup: Option<Wakeup>,
    pub outcome: Option<Yielded>,
}

/// Creates contexts and runs a batch of ready ones to their next
/// suspension point.
pub(crate) trait ContextFactory {
    fn name(&self) -> &'static str;

    fn create(&mut self, entry: ContextEntry) -> std::io::Result<Box<dyn Context>>;

    /// Fill in `outcome` for every dispatch. Outcomes are read back by
    /// maestro in batch order, whatever order the contexts actually ran in.
    fn run_ready(&mut self, batch: &mut [Dispatch<'_>]);

    /// Tear down factory-wide infrastructure.
    fn finalize(&mut self) {}
}

/// Build the factory selected by `config`.
pub(crate) fn build_factory(config: &SimConfig) -> Box<dyn ContextFactory> {
    match config.factory {
        FactoryKind::Serial(backend) => Box::new(SerialFactory::new(backend)),
        FactoryKind::Parallel { workers } => {
            Box::new(ParallelFactory::new(workers, config.parallel_threshold))
        }
    }
}

/// Create the context for `entry` with the given backend.
pub(crate) fn create_context(
    backend: ContextBackend,
    entry: ContextEntry,
) -> std::io::Result<Box<dyn Context>> {
    Ok(match backend {
        ContextBackend::Coroutine => Box::new(CoroutineContext::new(entry)?),
        ContextBackend::Thread => Box::new(ThreadContext::spawn(entry)?),
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
