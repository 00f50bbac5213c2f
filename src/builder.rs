/// Fluent builder for simulation setup.
///
/// Hides the boilerplate of wiring a platform, a resource model, a
/// configuration, observers and the initial actors together.

use std::sync::Arc;

use crate::actor::{Actor, ActorSpec};
use crate::config::{FactoryKind, SimConfig};
use crate::error::{KernelResult, SimResult};
use crate::model::{LinearModel, ResourceModel};
use crate::observer::Observer;
use crate::platform::{HostId, Platform};
use crate::simulation::{Simulation, SimulationReport};

// ── SimulationBuilder ─────────────────────────────────────────────────

/// Fluent builder for a [`Simulation`].
///
/// # Example
/// ```rust
/// use simkernel::{FactoryKind, HostId, SimulationBuilder, StaticPlatform};
///
/// let (sim, report) = SimulationBuilder::new(StaticPlatform::uniform(2, 1e9, 1e8, 1e-3))
///     .factory(FactoryKind::parallel())
///     .with_logging()
///     .actor("sender", HostId::new(0), |me| me.put("box", 7u8, 1e6))
///     .actor("receiver", HostId::new(1), |me| {
///         let v: u8 = me.get("box")?;
///         assert_eq!(v, 7);
///         Ok(())
///     })
///     .run()
///     .unwrap();
/// assert_eq!(report.exited_normally, 2);
/// assert!(sim.change_log().is_some());
/// ```
pub struct SimulationBuilder {
    platform: Arc<dyn Platform>,
    model: Option<Box<dyn ResourceModel>>,
    config: SimConfig,
    observers: Vec<Box<dyn Observer>>,
    logging: bool,
    actors: Vec<ActorSpec>,
}

impl SimulationBuilder {
    pub fn new(platform: impl Platform + 'static) -> Self {
        Self::with_platform(Arc::new(platform))
    }

    /// Share a platform between several simulations.
    pub fn with_platform(platform: Arc<dyn Platform>) -> Self {
        SimulationBuilder {
            platform,
            model: None,
            config: SimConfig::default(),
            observers: Vec::new(),
            logging: false,
            actors: Vec::new(),
        }
    }

    // ── Resources ─────────────────────────────────────────────

    /// Use `model` instead of the default [`LinearModel`].
    pub fn model(mut self, model: impl ResourceModel + 'static) -> Self {
        self.model = Some(Box::new(model));
        self
    }

    // ── Configuration ─────────────────────────────────────────

    pub fn config(mut self, config: SimConfig) -> Self {
        self.config = config;
        self
    }

    pub fn factory(mut self, factory: FactoryKind) -> Self {
        self.config.factory = factory;
        self
    }

    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.config.stack_size = bytes;
        self
    }

    pub fn parallel_threshold(mut self, threshold: usize) -> Self {
        self.config.parallel_threshold = threshold;
        self
    }

    // ── Hooks ─────────────────────────────────────────────────

    pub fn observer(mut self, observer: impl Observer + 'static) -> Self {
        self.observers.push(Box::new(observer));
        self
    }

    /// Record a [`ChangeLog`](crate::ChangeLog) of the run.
    pub fn with_logging(mut self) -> Self {
        self.logging = true;
        self
    }

    // ── Actors ────────────────────────────────────────────────

    /// Spawn an initial actor. Initial actors run in registration order.
    pub fn actor<F>(self, name: &str, host: HostId, body: F) -> Self
    where
        F: Fn(&mut Actor<'_>) -> SimResult<()> + Send + Sync + 'static,
    {
        self.spec(ActorSpec::new(name, host, body))
    }

    pub fn spec(mut self, spec: ActorSpec) -> Self {
        self.actors.push(spec);
        self
    }

    // ── Build ─────────────────────────────────────────────────

    /// Validate the configuration and spawn the initial actors.
    pub fn build(self) -> KernelResult<Simulation> {
        self.config.validate()?;
        let model = self
            .model
            .unwrap_or_else(|| Box::new(LinearModel::default()));
        let mut sim = Simulation::from_parts(self.platform, model, self.config);
        for observer in self.observers {
            sim.add_boxed_observer(observer);
        }
        if self.logging {
            sim.enable_logging();
        }
        for spec in self.actors {
            sim.spawn_with(spec)?;
        }
        Ok(sim)
    }

    /// Build and run to completion.
    pub fn run(self) -> KernelResult<(Simulation, SimulationReport)> {
        let mut sim = self.build()?;
        let report = sim.run()?;
        Ok((sim, report))
    }
}

impl std::fmt::Debug for SimulationBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulationBuilder")
            .field("config", &self.config)
            .field("custom_model", &self.model.is_some())
            .field("observers", &self.observers.len())
            .field("logging", &self.logging)
            .field("actors", &self.actors.len())
            .finish()
    }
}
