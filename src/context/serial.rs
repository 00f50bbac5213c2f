//! The serial factory: resumes every ready context in turn on maestro's
//! thread. Works with both context backends.

use tracing::trace;

use super::{create_context, Context, ContextEntry, ContextFactory, Dispatch};
use crate::config::ContextBackend;

/// Runs ready contexts one after another on maestro's thread.
pub(crate) struct SerialFactory {
    backend: ContextBackend,
}

impl SerialFactory {
    pub fn new(backend: ContextBackend) -> Self {
        SerialFactory { backend }
    }
}

impl ContextFactory for SerialFactory {
    fn name(&self) -> &'static str {
        match self.backend {
            ContextBackend::Coroutine => "serial/coroutine",
            ContextBackend::Thread => "serial/thread",
        }
    }

    fn create(&mut self, entry: ContextEntry) -> std::io::Result<Box<dyn Context>> {
        create_context(self.backend, entry)
    }

    fn run_ready(&mut self, batch: &mut [Dispatch<'_>]) {
        for dispatch in batch.iter_mut() {
            if let Some(wakeup) = dispatch.wakeup.take() {
                trace!(actor = %dispatch.actor, "run");
                dispatch.outcome = Some(dispatch.context.resume(wakeup));
            }
        }
    }
}
