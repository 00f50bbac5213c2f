//! The parallel factory: a work-stealing pool resumes a batch of thread
//! contexts concurrently.
//!
//! ```text
//!   maestro                          workers (N threads)
//!   ───────                          ───────────────────
//!   jobs ──► Injector ─────────────► steal_batch_and_pop ─► local LIFO
//!   park ◄── unpark (last job)       link.resume(wakeup)
//!                                    results.push((index, yielded))
//!   sort results by index
//! ```
//!
//! Contexts only touch their own stack while they run; every simcall they
//! yield is collected and applied by maestro afterwards, in batch order.
//! Small batches skip the pool and run inline, since the hand-off costs
//! more than it saves.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_deque::{Injector, Steal, Stealer, Worker};
use crossbeam_utils::sync::{Parker, Unparker};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::{Context, ContextEntry, ContextFactory, ContextLink, Dispatch, ThreadContext, Wakeup, Yielded};

/// How long an idle worker sleeps before re-checking the queues.
const IDLE_PARK: Duration = Duration::from_millis(1);

struct Job {
    index: usize,
    link: ContextLink,
    wakeup: Wakeup,
}

struct Shared {
    injector: Injector<Job>,
    stealers: Vec<Stealer<Job>>,
    unparkers: Vec<Unparker>,
    /// Jobs of the current batch not yet finished.
    remaining: AtomicUsize,
    done: AtomicBool,
    results: Mutex<Vec<(usize, Yielded)>>,
    maestro: Unparker,
}

impl Shared {
    fn unpark_all(&self) {
        for u in &self.unparkers {
            u.unpark();
        }
    }
}

struct WorkerPool {
    shared: Arc<Shared>,
    parker: Parker,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    fn new(workers: usize) -> std::io::Result<Self> {
        let workers = workers.max(1);
        let mut locals = Vec::with_capacity(workers);
        let mut stealers = Vec::with_capacity(workers);
        for _ in 0..workers {
            let w = Worker::new_lifo();
            stealers.push(w.stealer());
            locals.push(w);
        }

        let mut parkers = Vec::with_capacity(workers);
        let mut unparkers = Vec::with_capacity(workers);
        for _ in 0..workers {
            let p = Parker::new();
            unparkers.push(p.unparker().clone());
            parkers.push(p);
        }

        let parker = Parker::new();
        let shared = Arc::new(Shared {
            injector: Injector::new(),
            stealers,
            unparkers,
            remaining: AtomicUsize::new(0),
            done: AtomicBool::new(false),
            results: Mutex::new(Vec::new()),
            maestro: parker.unparker().clone(),
        });

        // Threads spawned so far are shut down by Drop if a later spawn fails.
        let mut pool = WorkerPool {
            shared,
            parker,
            threads: Vec::with_capacity(workers),
        };
        for (worker_id, (local, parker)) in locals.into_iter().zip(parkers).enumerate() {
            let shared = Arc::clone(&pool.shared);
            let th = thread::Builder::new()
                .name(format!("simkernel-worker-{worker_id}"))
                .spawn(move || worker_loop(worker_id, &local, &parker, &shared))?;
            pool.threads.push(th);
        }
        debug!(workers, "context worker pool started");
        Ok(pool)
    }

    /// Run every job to its next yield. Returns the outcomes sorted by
    /// job index.
    fn run(&self, jobs: Vec<Job>) -> Vec<(usize, Yielded)> {
        if jobs.is_empty() {
            return Vec::new();
        }
        self.shared.remaining.store(jobs.len(), Ordering::Release);
        for job in jobs {
            self.shared.injector.push(job);
        }
        self.shared.unpark_all();

        while self.shared.remaining.load(Ordering::Acquire) != 0 {
            self.parker.park();
        }

        let mut results = std::mem::take(&mut *self.shared.results.lock());
        results.sort_by_key(|(index, _)| *index);
        results
    }

    fn shutdown(&mut self) {
        self.shared.done.store(true, Ordering::Release);
        self.shared.unpark_all();
        for th in self.threads.drain(..) {
            if th.join().is_err() {
                warn!("context worker panicked during shutdown");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(worker_id: usize, local: &Worker<Job>, parker: &Parker, shared: &Shared) {
    loop {
        if shared.done.load(Ordering::Acquire) {
            break;
        }
        match find_job(worker_id, local, shared) {
            Some(job) => {
                trace!(worker_id, index = job.index, "resume context");
                let outcome = job.link.resume(job.wakeup);
                shared.results.lock().push((job.index, outcome));
                if shared.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    shared.maestro.unpark();
                }
            }
            None => parker.park_timeout(IDLE_PARK),
        }
    }
}

fn find_job(worker_id: usize, local: &Worker<Job>, shared: &Shared) -> Option<Job> {
    if let Some(job) = local.pop() {
        return Some(job);
    }
    loop {
        match shared.injector.steal_batch_and_pop(local) {
            Steal::Success(job) => return Some(job),
            Steal::Retry => continue,
            Steal::Empty => break,
        }
    }
    let n = shared.stealers.len();
    for offset in 1..n {
        let victim = (worker_id + offset) % n;
        if let Steal::Success(job) = shared.stealers[victim].steal() {
            return Some(job);
        }
    }
    None
}

/// Thread contexts, resumed concurrently by a worker pool once a batch
/// reaches `threshold` contexts.
pub(crate) struct ParallelFactory {
    workers: usize,
    threshold: usize,
    pool: Option<WorkerPool>,
    pool_failed: bool,
}

impl ParallelFactory {
    pub fn new(workers: usize, threshold: usize) -> Self {
        ParallelFactory {
            workers,
            threshold: threshold.max(1),
            pool: None,
            pool_failed: false,
        }
    }

    fn pool(&mut self) -> Option<&WorkerPool> {
        if self.pool.is_none() && !self.pool_failed {
            match WorkerPool::new(self.workers) {
                Ok(pool) => self.pool = Some(pool),
                Err(e) => {
                    warn!(error = %e, "cannot start worker pool, running contexts inline");
                    self.pool_failed = true;
                }
            }
        }
        self.pool.as_ref()
    }

    fn run_inline(batch: &mut [Dispatch<'_>]) {
        for dispatch in batch.iter_mut() {
            if let Some(wakeup) = dispatch.wakeup.take() {
                dispatch.outcome = Some(dispatch.context.resume(wakeup));
            }
        }
    }
}

impl ContextFactory for ParallelFactory {
    fn name(&self) -> &'static str {
        "parallel"
    }

    fn create(&mut self, entry: ContextEntry) -> std::io::Result<Box<dyn Context>> {
        Ok(Box::new(ThreadContext::spawn(entry)?))
    }

    fn run_ready(&mut self, batch: &mut [Dispatch<'_>]) {
        let pending = batch.iter().filter(|d| d.wakeup.is_some()).count();
        if pending < self.threshold || batch.iter().any(|d| d.context.link().is_none()) {
            Self::run_inline(batch);
            return;
        }

        let mut jobs = Vec::with_capacity(pending);
        for (index, dispatch) in batch.iter_mut().enumerate() {
            if let (Some(link), Some(wakeup)) = (dispatch.context.link(), dispatch.wakeup.take()) {
                jobs.push(Job { index, link, wakeup });
            }
        }

        match self.pool() {
            Some(pool) => {
                for (index, outcome) in pool.run(jobs) {
                    batch[index].outcome = Some(outcome);
                }
            }
            None => {
                for job in jobs {
                    batch[job.index].outcome = Some(job.link.resume(job.wakeup));
                }
            }
        }
    }

    fn finalize(&mut self) {
        if let Some(mut pool) = self.pool.take() {
            pool.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{ActorId, ExitStatus};
    use crate::context::{testing, Signal};

    fn contexts(factory: &mut ParallelFactory, n: usize) -> Vec<Box<dyn Context>> {
        (0..n)
            .map(|i| {
                let (entry, _) = testing::entry(&format!("p{i}"), |me| {
                    me.yield_now()?;
                    me.yield_now()
                });
                factory.create(entry).expect("context")
            })
            .collect()
    }

    fn run_batch(factory: &mut ParallelFactory, ctxs: &mut [Box<dyn Context>], signal: fn() -> Signal) -> Vec<Option<Yielded>> {
        let mut batch: Vec<Dispatch<'_>> = ctxs
            .iter_mut()
            .enumerate()
            .map(|(i, ctx)| Dispatch {
                actor: ActorId::new(i as u64 + 1),
                context: ctx.as_mut(),
                wakeup: Some(testing::wakeup(0.0, signal())),
                outcome: None,
            })
            .collect();
        factory.run_ready(&mut batch);
        batch.into_iter().map(|d| d.outcome).collect()
    }

    #[test]
    fn test_pool_runs_whole_batch() {
        let mut factory = ParallelFactory::new(3, 2);
        let mut ctxs = contexts(&mut factory, 8);

        for _ in 0..2 {
            let outcomes = run_batch(&mut factory, &mut ctxs, || Signal::Start);
            assert!(outcomes
                .iter()
                .all(|o| matches!(o, Some(Yielded::Simcall(_)))));
            // Subsequent turns answer the yields.
            let outcomes = run_batch(&mut factory, &mut ctxs, testing::unit);
            assert!(outcomes
                .iter()
                .all(|o| matches!(o, Some(Yielded::Simcall(_)))));
            let outcomes = run_batch(&mut factory, &mut ctxs, testing::unit);
            assert!(outcomes
                .iter()
                .all(|o| matches!(o, Some(Yielded::Exited(ExitStatus::Normal)))));
            assert!(ctxs.iter().all(|c| c.is_finished()));
            ctxs = contexts(&mut factory, 8);
        }
        assert!(factory.pool.is_some());
        factory.finalize();
        assert!(factory.pool.is_none());
    }

    #[test]
    fn test_small_batch_runs_inline() {
        let mut factory = ParallelFactory::new(2, 4);
        let mut ctxs = contexts(&mut factory, 2);
        let outcomes = run_batch(&mut factory, &mut ctxs, || Signal::Start);
        assert!(outcomes.iter().all(|o| o.is_some()));
        assert!(factory.pool.is_none());
    }
}
