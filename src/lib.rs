//! # simkernel: deterministic cooperative-execution kernel
//!
//! The core of a discrete-event simulator for distributed systems.
//! Simulated processes (actors) are plain Rust closures running on their
//! own stacks; they suspend only at well-defined primitives (wait, sleep,
//! send, receive, execute...) and a single driver, maestro, decides who
//! runs next and when virtual time moves.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  Simulation / SimulationBuilder              │ ← public driver
//! │  ┌────────────────────────────────────────┐  │
//! │  │  Kernel (maestro)                      │  │ ← ready queue, simcalls
//! │  │  ┌──────────────┐  ┌────────────────┐  │  │
//! │  │  │ContextFactory│  │ ActivityArena  │  │  │ ← serial / parallel
//! │  │  │ coroutine or │  │ Mailboxes      │  │  │
//! │  │  │ thread ctxs  │  │ Timeline       │  │  │ ← timers
//! │  │  └──────────────┘  └────────────────┘  │  │
//! │  └───────────────┬────────────────────────┘  │
//! │                  │ attach / advance / poll    │
//! │  ┌───────────────▼────────────────────────┐  │
//! │  │  ResourceModel  +  Platform            │  │ ← external
//! │  └────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Serial and parallel context factories produce the same run: contexts
//! only ever talk to maestro through simcalls, which maestro applies in a
//! fixed order once every context of a pass has yielded.

pub mod activity;
pub mod actor;
pub mod builder;
pub mod config;
pub(crate) mod context;
pub mod error;
pub(crate) mod event;
pub mod eventlog;
pub(crate) mod kernel;
pub mod mailbox;
pub mod model;
pub mod observer;
pub mod platform;
pub(crate) mod simcall;
pub mod simulation;
pub mod sync;
pub mod time;
pub(crate) mod timeline;

// Re-exports for convenience.
pub use activity::{Activity, ActivityId, ActivityKind, ActivityState, CommSpec, ExecSpec, Failure};
pub use actor::{Actor, ActorBody, ActorId, ActorRef, ActorSpec, ExitStatus};
pub use builder::SimulationBuilder;
pub use config::{ContextBackend, FactoryKind, SimConfig};
pub use error::{KernelError, KernelResult, SimError, SimResult};
pub use eventlog::{logs_match, ChangeLog};
pub use mailbox::CommSide;
pub use model::{Completion, Demand, HostEvent, LinearModel, ModelConfig, ResourceHandle, ResourceModel};
pub use observer::{ChangeKind, ExitKind, Observer, StateChange, Subject};
pub use platform::{HostId, LinkId, LinkRef, Platform, StaticPlatform};
pub use simulation::{Simulation, SimulationReport};
pub use sync::MutexId;
pub use time::VirtualTime;
