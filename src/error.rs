//! Structured error types for the simulation kernel.
//!
//! Two families are kept apart on purpose:
//!
//! - [`SimError`] is a failure *inside the simulated world* (a host went
//!   down, a transfer broke, a wait timed out, an activity was canceled).
//!   Every blocking primitive returns it and actor code may recover.
//! - [`KernelError`] is a violated kernel invariant or a setup problem.
//!   It aborts [`Simulation::run`](crate::Simulation::run).

use crate::platform::HostId;

/// A recoverable, simulated-world failure returned by blocking primitives.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum SimError {
    /// The host running the activity (or one of its endpoints) was turned off.
    #[error("host failure")]
    HostFailure,

    /// A link carrying the communication failed.
    #[error("transfer failure")]
    TransferFailure,

    /// The deadline of the wait (or of the activity itself) elapsed first.
    #[error("timeout")]
    Timeout,

    /// The activity was canceled, e.g. because its partner was killed.
    #[error("operation canceled")]
    OperationCanceled,

    /// The calling actor has been killed. Bodies propagate this with `?`
    /// so their stack unwinds and exit handlers run.
    #[error("actor terminated")]
    Terminated,

    /// A spawn could not allocate the new actor's context.
    #[error("context allocation failed: {0}")]
    AllocationFailure(String),
}

impl SimError {
    /// Whether this error means the caller itself is being killed.
    pub fn is_terminated(&self) -> bool {
        matches!(self, SimError::Terminated)
    }
}

/// Result of a blocking primitive.
pub type SimResult<T> = Result<T, SimError>;

/// A fatal kernel error. The run is aborted and every context torn down.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum KernelError {
    /// A kernel invariant was violated by the named actor (or by maestro).
    #[error("invalid state in {actor}: {detail}")]
    InvalidState { actor: String, detail: String },

    /// A context stack could not be allocated for a driver-side spawn.
    #[error("could not allocate a context for actor '{actor}': {reason}")]
    AllocationFailure { actor: String, reason: String },

    /// An actor body panicked.
    #[error("actor {actor} panicked: {message}")]
    ActorPanicked { actor: String, message: String },

    /// The configuration could not be used.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A host id that the platform does not know about.
    #[error("unknown host {0}")]
    UnknownHost(HostId),
}

impl KernelError {
    pub(crate) fn invalid_state(actor: impl Into<String>, detail: impl Into<String>) -> Self {
        KernelError::InvalidState {
            actor: actor.into(),
            detail: detail.into(),
        }
    }
}

/// Convenience alias for `Result<T, KernelError>`.
pub type KernelResult<T> = Result<T, KernelError>;
