/// Public simulation driver.
///
/// Owns the kernel, spawns the initial actors and runs maestro's loop to
/// completion (or up to a virtual instant). At the end it reports how
/// many actors exited normally and how many were killed.

use std::sync::Arc;

use crate::actor::{Actor, ActorRef, ActorSpec};
use crate::builder::SimulationBuilder;
use crate::config::SimConfig;
use crate::error::{KernelError, KernelResult, SimResult};
use crate::eventlog::ChangeLog;
use crate::kernel::{Kernel, RunState, SpawnError};
use crate::model::{LinearModel, ResourceModel};
use crate::observer::Observer;
use crate::platform::{HostId, Platform};
use crate::sync::MutexId;
use crate::time::VirtualTime;

// ── Report ────────────────────────────────────────────────────────────

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct SimulationReport {
    pub end_time: VirtualTime,
    /// Scheduling passes run.
    pub rounds: u64,
    /// Times the clock actually moved forward.
    pub clock_advances: u64,
    pub exited_normally: usize,
    pub killed: usize,
    /// Bodies that returned an unhandled simulated-world error.
    pub failed: usize,
    /// One line per actor found blocked forever, if any.
    pub deadlocked: Vec<String>,
}

impl SimulationReport {
    pub fn is_clean(&self) -> bool {
        self.killed == 0 && self.failed == 0 && self.deadlocked.is_empty()
    }
}

impl std::fmt::Display for SimulationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ended at {}: {} exited, {} killed, {} failed ({} rounds, {} clock advances)",
            self.end_time,
            self.exited_normally,
            self.killed,
            self.failed,
            self.rounds,
            self.clock_advances
        )?;
        if !self.deadlocked.is_empty() {
            write!(f, ", {} deadlocked", self.deadlocked.len())?;
        }
        Ok(())
    }
}

// ── Simulation ────────────────────────────────────────────────────────

/// Top-level simulation driver.
///
/// ```rust
/// use simkernel::{HostId, Simulation, StaticPlatform};
///
/// let mut sim = Simulation::new(StaticPlatform::single_host(1e9));
/// sim.spawn("sleeper", HostId::new(0), |me| me.sleep_for(2.5)).unwrap();
/// let report = sim.run().unwrap();
/// assert_eq!(report.end_time.secs(), 2.5);
/// ```
pub struct Simulation {
    kernel: Kernel,
    finished: bool,
}

impl Simulation {
    /// A simulation on `platform` with the reference [`LinearModel`] and
    /// the default configuration (serial coroutine contexts).
    pub fn new(platform: impl Platform + 'static) -> Self {
        Self::from_parts(
            Arc::new(platform),
            Box::new(LinearModel::default()),
            SimConfig::default(),
        )
    }

    /// Start a [`SimulationBuilder`] on `platform`.
    pub fn builder(platform: impl Platform + 'static) -> SimulationBuilder {
        SimulationBuilder::new(platform)
    }

    /// `config` must already be validated.
    pub(crate) fn from_parts(
        platform: Arc<dyn Platform>,
        model: Box<dyn ResourceModel>,
        config: SimConfig,
    ) -> Self {
        Simulation {
            kernel: Kernel::new(platform, model, config),
            finished: false,
        }
    }

    pub fn now(&self) -> VirtualTime {
        self.kernel.now()
    }

    /// Name of the context factory in use, e.g. `"serial/coroutine"`.
    pub fn factory_name(&self) -> &'static str {
        self.kernel.factory_name()
    }

    pub fn live_actors(&self) -> usize {
        self.kernel.live_actors()
    }

    /// Activity records not reclaimed yet.
    pub fn live_activities(&self) -> usize {
        self.kernel.live_activities()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    // ── Actors ────────────────────────────────────────────────────────

    /// Spawn an actor running `body` on `host`. It runs in the first
    /// scheduling pass, in spawn order.
    pub fn spawn<F>(&mut self, name: &str, host: HostId, body: F) -> KernelResult<ActorRef>
    where
        F: Fn(&mut Actor<'_>) -> SimResult<()> + Send + Sync + 'static,
    {
        self.spawn_with(ActorSpec::new(name, host, body))
    }

    pub fn spawn_with(&mut self, spec: ActorSpec) -> KernelResult<ActorRef> {
        if self.finished {
            return Err(KernelError::invalid_state(
                spec.name(),
                "spawned after the simulation finished",
            ));
        }
        let name = spec.name().to_string();
        let host = spec.host();
        match self.kernel.spawn_actor(spec)? {
            Ok(actor) => Ok(actor),
            Err(SpawnError::HostOff) => Err(KernelError::AllocationFailure {
                actor: name,
                reason: format!("host {} is off", host),
            }),
            Err(SpawnError::Allocation(reason)) => {
                Err(KernelError::AllocationFailure { actor: name, reason })
            }
        }
    }

    /// A fresh mutex, for actors spawned from the driver to share.
    pub fn create_mutex(&mut self) -> MutexId {
        self.kernel.create_mutex()
    }

    // ── Hooks ─────────────────────────────────────────────────────────

    /// Register a state-change observer. Observers are called on the
    /// driver's thread, in emission order.
    pub fn add_observer(&mut self, observer: impl Observer + 'static) {
        self.kernel.add_observer(Box::new(observer));
    }

    pub(crate) fn add_boxed_observer(&mut self, observer: Box<dyn Observer>) {
        self.kernel.add_observer(observer);
    }

    /// Record every state change into a [`ChangeLog`].
    pub fn enable_logging(&mut self) {
        self.kernel.enable_logging();
    }

    pub fn change_log(&self) -> Option<&ChangeLog> {
        self.kernel.change_log()
    }

    // ── Running ───────────────────────────────────────────────────────

    /// Run until no actor is left.
    ///
    /// Fails with the first fatal kernel error; every remaining context is
    /// torn down before returning it.
    pub fn run(&mut self) -> KernelResult<SimulationReport> {
        if !self.finished {
            let result = self.kernel.run(None);
            self.finished = true;
            result?;
        }
        Ok(self.report())
    }

    /// Run up to virtual time `until`. Returns the report if the
    /// simulation finished, `None` if it paused at `until`; calling again
    /// with a later limit resumes it.
    pub fn run_until(&mut self, until: VirtualTime) -> KernelResult<Option<SimulationReport>> {
        if self.finished {
            return Ok(Some(self.report()));
        }
        match self.kernel.run(Some(until)) {
            Ok(RunState::Finished) => {
                self.finished = true;
                Ok(Some(self.report()))
            }
            Ok(RunState::Paused) => Ok(None),
            Err(e) => {
                self.finished = true;
                Err(e)
            }
        }
    }

    /// Statistics so far.
    pub fn report(&self) -> SimulationReport {
        let stats = self.kernel.stats();
        SimulationReport {
            end_time: self.kernel.now(),
            rounds: stats.passes,
            clock_advances: stats.clock_advances,
            exited_normally: stats.exited_normally,
            killed: stats.killed,
            failed: stats.failed,
            deadlocked: stats.deadlocked.clone(),
        }
    }
}

impl std::fmt::Debug for Simulation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulation")
            .field("now", &self.kernel.now())
            .field("factory", &self.kernel.factory_name())
            .field("live_actors", &self.kernel.live_actors())
            .field("finished", &self.finished)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::StaticPlatform;

    #[test]
    fn test_empty_simulation() {
        let mut sim = Simulation::new(StaticPlatform::single_host(1.0));
        let report = sim.run().unwrap();
        assert_eq!(report.end_time, VirtualTime::ZERO);
        assert_eq!(report.exited_normally, 0);
        assert!(report.is_clean());
        assert!(sim.is_finished());
    }

    #[test]
    fn test_spawn_on_unknown_host_is_fatal() {
        let mut sim = Simulation::new(StaticPlatform::single_host(1.0));
        let err = sim.spawn("lost", HostId::new(7), |_| Ok(())).unwrap_err();
        assert_eq!(err, KernelError::UnknownHost(HostId::new(7)));
    }

    #[test]
    fn test_spawn_after_finish_is_refused() {
        let mut sim = Simulation::new(StaticPlatform::single_host(1.0));
        sim.run().unwrap();
        let err = sim.spawn("late", HostId::new(0), |_| Ok(())).unwrap_err();
        assert!(matches!(err, KernelError::InvalidState { .. }));
    }

    #[test]
    fn test_run_is_idempotent_once_finished() {
        let mut sim = Simulation::new(StaticPlatform::single_host(1.0));
        sim.spawn("a", HostId::new(0), |me| me.sleep_for(1.0)).unwrap();
        let first = sim.run().unwrap();
        let second = sim.run().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.end_time, VirtualTime::new(1.0));
    }

    #[test]
    fn test_report_display() {
        let report = SimulationReport {
            end_time: VirtualTime::new(4.0),
            rounds: 3,
            clock_advances: 2,
            exited_normally: 2,
            killed: 1,
            failed: 0,
            deadlocked: vec!["'x' (A3) blocked (sleep)".into()],
        };
        assert_eq!(
            report.to_string(),
            "ended at T=4: 2 exited, 1 killed, 0 failed (3 rounds, 2 clock advances), 1 deadlocked"
        );
        assert!(!report.is_clean());
    }
}
