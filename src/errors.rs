// src/errors.rs

//! Crate-wide error types and aliases.
//!
//! - [`EngineError`] is what the build engine hands back to task bodies and
//!   top-level callers. It is `Clone` because a single memoized failure is
//!   delivered to every waiter of the same task.
//! - [`DynbuildError`] wraps configuration, IO and engine failures for the
//!   CLI layer.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::types::TaskId;

#[derive(Error, Debug, Clone)]
pub enum EngineError {
    /// Every participant of the build is blocked; nothing can make progress.
    #[error("task execution deadlocked while waiting for {waiting_on}")]
    Deadlocked { waiting_on: WaitTarget },

    #[error("task '{task}' failed: {cause}")]
    TaskFailed {
        task: TaskId,
        cause: Arc<anyhow::Error>,
    },

    /// The identifier was already started with a factory of a different
    /// fingerprint.
    #[error("task '{task}' was started again with an incompatible factory")]
    DuplicateTaskIdentifier { task: TaskId },

    #[error("illegal operation on task '{task}': {reason}")]
    IllegalTaskOperation { task: TaskId, reason: String },

    #[error("wait condition on {target} failed: {cause}")]
    WaitCondition {
        target: WaitTarget,
        cause: Arc<anyhow::Error>,
    },

    #[error("failed to spawn worker thread: {0}")]
    WorkerSpawn(Arc<std::io::Error>),
}

impl EngineError {
    pub fn task_failed(task: TaskId, cause: anyhow::Error) -> Self {
        EngineError::TaskFailed {
            task,
            cause: Arc::new(cause),
        }
    }

    pub fn is_deadlock(&self) -> bool {
        matches!(self, EngineError::Deadlocked { .. })
    }

    /// Follow nested task failures down to the error that started the chain.
    ///
    /// A task that awaited a failed dependency and propagated the error with
    /// `?` produces `TaskFailed { cause: TaskFailed { .. } }`; this returns
    /// the innermost engine error in that chain.
    pub fn root_cause(&self) -> &EngineError {
        let mut current = self;
        while let EngineError::TaskFailed { cause, .. } = current {
            match cause.downcast_ref::<EngineError>() {
                Some(inner) => current = inner,
                None => break,
            }
        }
        current
    }

    /// True if this error, or any task failure it wraps, is a deadlock.
    pub fn involves_deadlock(&self) -> bool {
        self.root_cause().is_deadlock()
    }
}

/// What a deadlocked participant was blocked on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitTarget {
    Task(TaskId),
    /// A top-level caller waiting for every started task to finish.
    Quiescence,
}

impl fmt::Display for WaitTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitTarget::Task(id) => write!(f, "task '{id}'"),
            WaitTarget::Quiescence => f.write_str("build quiescence"),
        }
    }
}

#[derive(Error, Debug)]
pub enum DynbuildError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Cycle detected in task plan: {0}")]
    PlanCycle(String),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, DynbuildError>;
pub type EngineResult<T> = std::result::Result<T, EngineError>;
