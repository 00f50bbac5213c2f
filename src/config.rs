//! Kernel configuration: which context factory runs the actors, and how.
//!
//! Defaults give a serial, coroutine-backed kernel. Any field can be
//! overridden from the environment with [`SimConfig::from_env`]:
//!
//! | Variable | Meaning | Default |
//! |---|---|---|
//! | `SIMKERNEL_CONTEXTS` | `coroutine`, `thread` or `parallel` | `coroutine` |
//! | `SIMKERNEL_WORKERS` | worker threads of the parallel factory | available parallelism |
//! | `SIMKERNEL_STACK_SIZE` | context stack size in bytes | 262144 |
//! | `SIMKERNEL_PARALLEL_THRESHOLD` | smallest batch handed to the pool | 2 |

use std::str::FromStr;

use crate::error::{KernelError, KernelResult};

pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;
pub const DEFAULT_PARALLEL_THRESHOLD: usize = 2;

/// Smallest stack a context may ask for.
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// How a serial factory backs its contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum ContextBackend {
    /// Stack-switching coroutines on maestro's thread.
    Coroutine,
    /// One parked OS thread per actor.
    Thread,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum FactoryKind {
    /// Run ready actors one after another, in ready-list order.
    Serial(ContextBackend),
    /// Run ready actors on a pool of `workers` threads.
    Parallel { workers: usize },
}

impl FactoryKind {
    pub fn parallel() -> Self {
        FactoryKind::Parallel {
            workers: default_workers(),
        }
    }
}

impl Default for FactoryKind {
    fn default() -> Self {
        FactoryKind::Serial(ContextBackend::Coroutine)
    }
}

impl FromStr for FactoryKind {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "coroutine" | "serial" => Ok(FactoryKind::Serial(ContextBackend::Coroutine)),
            "thread" => Ok(FactoryKind::Serial(ContextBackend::Thread)),
            "parallel" => Ok(FactoryKind::parallel()),
            other => Err(KernelError::InvalidConfig(format!(
                "unknown context factory '{other}' (expected coroutine, thread or parallel)"
            ))),
        }
    }
}

impl std::fmt::Display for FactoryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FactoryKind::Serial(ContextBackend::Coroutine) => write!(f, "serial/coroutine"),
            FactoryKind::Serial(ContextBackend::Thread) => write!(f, "serial/thread"),
            FactoryKind::Parallel { workers } => write!(f, "parallel({workers})"),
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct SimConfig {
    pub factory: FactoryKind,
    /// Default stack size of every context, in bytes.
    pub stack_size: usize,
    /// Batches smaller than this run inline even under the parallel factory.
    pub parallel_threshold: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            factory: FactoryKind::default(),
            stack_size: DEFAULT_STACK_SIZE,
            parallel_threshold: DEFAULT_PARALLEL_THRESHOLD,
        }
    }
}

impl SimConfig {
    pub fn serial() -> Self {
        Self::default()
    }

    pub fn threads() -> Self {
        SimConfig {
            factory: FactoryKind::Serial(ContextBackend::Thread),
            ..Self::default()
        }
    }

    pub fn parallel(workers: usize) -> Self {
        SimConfig {
            factory: FactoryKind::Parallel { workers },
            ..Self::default()
        }
    }

    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    pub fn with_parallel_threshold(mut self, threshold: usize) -> Self {
        self.parallel_threshold = threshold;
        self
    }

    /// Defaults overridden by the `SIMKERNEL_*` environment variables.
    pub fn from_env() -> KernelResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> KernelResult<Self> {
        let mut config = SimConfig::default();
        if let Some(v) = lookup("SIMKERNEL_CONTEXTS") {
            config.factory = v.parse()?;
        }
        if let Some(v) = lookup("SIMKERNEL_WORKERS") {
            let workers = parse_number("SIMKERNEL_WORKERS", &v)?;
            match config.factory {
                FactoryKind::Parallel { .. } => config.factory = FactoryKind::Parallel { workers },
                _ => {
                    return Err(KernelError::InvalidConfig(
                        "SIMKERNEL_WORKERS requires SIMKERNEL_CONTEXTS=parallel".into(),
                    ))
                }
            }
        }
        if let Some(v) = lookup("SIMKERNEL_STACK_SIZE") {
            config.stack_size = parse_number("SIMKERNEL_STACK_SIZE", &v)?;
        }
        if let Some(v) = lookup("SIMKERNEL_PARALLEL_THRESHOLD") {
            config.parallel_threshold = parse_number("SIMKERNEL_PARALLEL_THRESHOLD", &v)?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> KernelResult<()> {
        if self.stack_size < MIN_STACK_SIZE {
            return Err(KernelError::InvalidConfig(format!(
                "stack size {} is below the minimum of {} bytes",
                self.stack_size, MIN_STACK_SIZE
            )));
        }
        if let FactoryKind::Parallel { workers: 0 } = self.factory {
            return Err(KernelError::InvalidConfig(
                "the parallel factory needs at least one worker".into(),
            ));
        }
        if self.parallel_threshold == 0 {
            return Err(KernelError::InvalidConfig(
                "parallel threshold must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn parse_number(key: &str, value: &str) -> KernelResult<usize> {
    value
        .trim()
        .parse()
        .map_err(|_| KernelError::InvalidConfig(format!("{key}: '{value}' is not a number")))
}
