// src/engine/future.rs

//! Per-task result slot.
//!
//! A [`TaskFuture`] exists for every identifier anyone has started or waited
//! for. Its state moves `NotStarted -> Running <-> Blocked -> Completed|Failed`
//! and never leaves a terminal state.

use std::sync::Arc;

use crate::engine::accounting::WaiterAccounting;
use crate::engine::wait::{Events, WaitCell, WaitError, WaiterTag};
use crate::errors::{EngineError, EngineResult};
use crate::types::{Fingerprint, TaskId, TaskValue};

#[derive(Debug, Clone)]
pub enum TaskExecutionState {
    /// Nobody has started the task yet; waiters may already be registered.
    NotStarted,
    Running,
    /// The task body is blocked waiting for another task.
    Blocked,
    Completed(TaskValue),
    Failed(EngineError),
}

impl TaskExecutionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskExecutionState::Completed(_) | TaskExecutionState::Failed(_)
        )
    }

    pub fn is_started(&self) -> bool {
        !matches!(self, TaskExecutionState::NotStarted)
    }

    /// The memoized outcome, if the task has finished.
    pub fn outcome(&self) -> Option<EngineResult<TaskValue>> {
        match self {
            TaskExecutionState::Completed(value) => Some(Ok(value.clone())),
            TaskExecutionState::Failed(err) => Some(Err(err.clone())),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct FutureSlot {
    pub state: TaskExecutionState,
    /// Fingerprint of the factory that claimed the task.
    pub fingerprint: Option<Fingerprint>,
}

#[derive(Debug)]
struct FutureInner {
    id: TaskId,
    cell: WaitCell<FutureSlot>,
}

/// Shared handle to one task's result slot.
#[derive(Debug, Clone)]
pub struct TaskFuture {
    inner: Arc<FutureInner>,
}

/// Result of trying to become the starter of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The caller moved the task out of `NotStarted` and must run it.
    Won,
    /// Somebody else already started it with an equal factory.
    Existing,
}

impl TaskFuture {
    pub(crate) fn new(id: TaskId) -> Self {
        Self {
            inner: Arc::new(FutureInner {
                id,
                cell: WaitCell::new(FutureSlot {
                    state: TaskExecutionState::NotStarted,
                    fingerprint: None,
                }),
            }),
        }
    }

    pub fn id(&self) -> &TaskId {
        &self.inner.id
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> TaskExecutionState {
        self.inner.cell.read(|slot| slot.state.clone())
    }

    pub fn fingerprint(&self) -> Option<Fingerprint> {
        self.inner.cell.read(|slot| slot.fingerprint)
    }

    pub fn is_terminal(&self) -> bool {
        self.inner.cell.read(|slot| slot.state.is_terminal())
    }

    /// Non-blocking access to the memoized outcome.
    pub fn try_result(&self) -> Option<EngineResult<TaskValue>> {
        self.inner.cell.read(|slot| slot.state.outcome())
    }

    pub fn ptr_eq(&self, other: &TaskFuture) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Atomically claim the task for `fingerprint`.
    ///
    /// Exactly one caller ever gets [`Claim::Won`] for a given future.
    pub(crate) fn claim(
        &self,
        fingerprint: Fingerprint,
        accounting: &WaiterAccounting,
    ) -> EngineResult<Claim> {
        let id = &self.inner.id;
        self.inner.cell.update(accounting, |slot| match slot.fingerprint {
            None => {
                debug_assert!(matches!(slot.state, TaskExecutionState::NotStarted));
                slot.fingerprint = Some(fingerprint);
                slot.state = TaskExecutionState::Running;
                (Ok(Claim::Won), Events::STARTED)
            }
            Some(existing) if existing == fingerprint => (Ok(Claim::Existing), Events::NONE),
            Some(_) => (
                Err(EngineError::DuplicateTaskIdentifier { task: id.clone() }),
                Events::NONE,
            ),
        })
    }

    /// Store the final outcome and wake everyone waiting for it.
    ///
    /// Returns false if the future was already terminal.
    pub(crate) fn complete(
        &self,
        outcome: EngineResult<TaskValue>,
        accounting: &WaiterAccounting,
    ) -> bool {
        self.inner.cell.update(accounting, |slot| {
            if slot.state.is_terminal() {
                return (false, Events::NONE);
            }
            slot.state = match outcome {
                Ok(value) => TaskExecutionState::Completed(value),
                Err(err) => TaskExecutionState::Failed(err),
            };
            (true, Events::FINISHED)
        })
    }

    /// Flip between `Running` and `Blocked`. Nobody waits for this change.
    pub(crate) fn set_blocked(&self, blocked: bool, accounting: &WaiterAccounting) {
        self.inner.cell.update(accounting, |slot| {
            slot.state = match (&slot.state, blocked) {
                (TaskExecutionState::Running, true) => TaskExecutionState::Blocked,
                (TaskExecutionState::Blocked, false) => TaskExecutionState::Running,
                _ => return ((), Events::NONE),
            };
            ((), Events::NONE)
        })
    }

    /// Block until the task is terminal and return its memoized outcome.
    pub(crate) fn wait_result(
        &self,
        accounting: &WaiterAccounting,
        tag: &WaiterTag,
    ) -> Result<EngineResult<TaskValue>, WaitError> {
        self.inner
            .cell
            .wait_until(accounting, tag, Events::FINISHED, |slot| {
                Ok(slot.state.outcome())
            })
    }

    /// Block until `predicate` accepts the state, re-checking after each
    /// change in `events`.
    pub(crate) fn wait_for_state(
        &self,
        accounting: &WaiterAccounting,
        tag: &WaiterTag,
        events: Events,
        mut predicate: impl FnMut(&TaskExecutionState) -> anyhow::Result<bool>,
    ) -> Result<TaskExecutionState, WaitError> {
        self.inner.cell.wait_until(accounting, tag, events, |slot| {
            Ok(predicate(&slot.state)?.then(|| slot.state.clone()))
        })
    }

    pub(crate) fn wake_all(&self) {
        self.inner.cell.wake_all();
    }

    pub(crate) fn waiter_tags(&self) -> Vec<WaiterTag> {
        self.inner.cell.waiter_tags()
    }
}
