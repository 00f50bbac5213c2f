//! Contexts backed by dedicated OS threads.
//!
//! The actor thread blocks on a rendezvous channel between turns, so at
//! most one side of the pair runs at a time: resuming is "send a wakeup,
//! wait for the next yield". The resume handle ([`ContextLink`]) is
//! `Send`, which lets the parallel factory's workers drive these contexts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::trace;

use super::{Context, ContextEntry, Signal, Transport, Wakeup, Yielded};
use crate::actor::{ActorId, ExitStatus};
use crate::platform::HostId;
use crate::simcall::Simcall;
use crate::time::VirtualTime;

/// The resumer's end of a thread context.
#[derive(Clone)]
pub(crate) struct ContextLink {
    actor: ActorId,
    to_actor: Sender<Wakeup>,
    from_actor: Receiver<Yielded>,
}

impl ContextLink {
    /// Hand control to the actor thread and wait until it yields back.
    pub fn resume(&self, wakeup: Wakeup) -> Yielded {
        trace!(actor = %self.actor, "hand off to context thread");
        if self.to_actor.send(wakeup).is_err() {
            return Yielded::Exited(ExitStatus::Panicked(format!(
                "context thread of {} is gone",
                self.actor
            )));
        }
        match self.from_actor.recv() {
            Ok(yielded) => yielded,
            Err(_) => Yielded::Exited(ExitStatus::Panicked(format!(
                "context thread of {} hung up",
                self.actor
            ))),
        }
    }
}

struct ThreadTransport {
    wakeups: Receiver<Wakeup>,
    yields: Sender<Yielded>,
    now: VirtualTime,
    host: HostId,
}

impl ThreadTransport {
    /// Delivered when the kernel side disappeared while we were parked.
    fn orphaned(&self) -> Wakeup {
        Wakeup {
            now: self.now,
            host: self.host,
            signal: Signal::Terminate,
        }
    }
}

impl Transport for ThreadTransport {
    fn suspend(&mut self, call: Simcall) -> Wakeup {
        if self.yields.send(Yielded::Simcall(call)).is_err() {
            return self.orphaned();
        }
        match self.wakeups.recv() {
            Ok(w) => {
                self.now = w.now;
                self.host = w.host;
                w
            }
            Err(_) => self.orphaned(),
        }
    }
}

/// A context running on its own OS thread.
pub(crate) struct ThreadContext {
    link: Option<ContextLink>,
    started: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ThreadContext {
    pub fn spawn(entry: ContextEntry) -> std::io::Result<Self> {
        let actor = entry.actor;
        let (wake_tx, wake_rx) = bounded::<Wakeup>(1);
        let (yield_tx, yield_rx) = bounded::<Yielded>(1);
        let started = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let thread_started = Arc::clone(&started);
        let thread_finished = Arc::clone(&finished);

        let handle = thread::Builder::new()
            .name(format!("actor-{}-{}", actor.raw(), entry.name))
            .stack_size(entry.stack_size)
            .spawn(move || {
                // Dropped before ever being scheduled.
                let Ok(first) = wake_rx.recv() else {
                    return;
                };
                thread_started.store(true, Ordering::Release);
                let mut transport = ThreadTransport {
                    wakeups: wake_rx,
                    yields: yield_tx.clone(),
                    now: first.now,
                    host: first.host,
                };
                let status = entry.enter(&mut transport, first);
                thread_finished.store(true, Ordering::Release);
                let _ = yield_tx.send(Yielded::Exited(status));
            })?;

        Ok(ThreadContext {
            link: Some(ContextLink {
                actor,
                to_actor: wake_tx,
                from_actor: yield_rx,
            }),
            started,
            finished,
            handle: Some(handle),
        })
    }
}

impl Context for ThreadContext {
    fn resume(&mut self, wakeup: Wakeup) -> Yielded {
        match &self.link {
            Some(link) => link.resume(wakeup),
            None => Yielded::Exited(ExitStatus::Panicked("context already torn down".into())),
        }
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    fn has_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    fn link(&self) -> Option<ContextLink> {
        self.link.clone()
    }
}

impl Drop for ThreadContext {
    fn drop(&mut self) {
        // Closing our ends makes a parked actor thread see a terminate,
        // unwind its body and exit.
        self.link.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing;

    #[test]
    fn test_thread_backend_contract() {
        testing::exercise_backend(|entry| {
            Box::new(ThreadContext::spawn(entry).expect("thread spawn"))
        });
    }

    #[test]
    fn test_link_drives_from_another_thread() {
        let (entry, _) = testing::entry("remote", |me| me.sleep_for(1.0));
        let mut ctx = ThreadContext::spawn(entry).expect("thread spawn");
        let link = ctx.link().expect("thread contexts expose a link");

        let first = std::thread::spawn(move || {
            matches!(
                link.resume(testing::wakeup(0.0, Signal::Start)),
                Yielded::Simcall(_)
            )
        })
        .join()
        .expect("driver thread");
        assert!(first);
        assert!(ctx.has_started());

        assert!(matches!(
            ctx.resume(testing::wakeup(1.0, testing::unit())),
            Yielded::Exited(ExitStatus::Normal)
        ));
        assert!(ctx.is_finished());
    }

    #[test]
    fn test_drop_parked_thread() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let (entry, _) = testing::entry("parked", move |me| {
            let tx = tx.clone();
            me.on_exit(move |failed| {
                let _ = tx.send(failed);
            });
            me.sleep_for(10.0)
        });
        let mut ctx = ThreadContext::spawn(entry).expect("thread spawn");
        assert!(matches!(
            ctx.resume(testing::wakeup(0.0, Signal::Start)),
            Yielded::Simcall(_)
        ));
        drop(ctx);
        assert_eq!(rx.try_recv().ok(), Some(true));
    }
}
