// src/engine/context.rs

//! Engine access for a running task body.

use std::sync::Arc;

use crate::engine::future::{TaskExecutionState, TaskFuture};
use crate::engine::wait::{Events, WaiterTag};
use crate::engine::EngineShared;
use crate::errors::{EngineError, EngineResult};
use crate::task::TaskFactory;
use crate::types::{TaskId, TaskValue};

/// Handed to [`Task::run`](crate::task::Task::run). Only valid for the
/// duration of the body.
pub struct TaskContext<'a> {
    engine: &'a Arc<EngineShared>,
    future: &'a TaskFuture,
    tag: WaiterTag,
}

impl<'a> TaskContext<'a> {
    pub(crate) fn new(engine: &'a Arc<EngineShared>, future: &'a TaskFuture) -> Self {
        Self {
            engine,
            future,
            tag: WaiterTag::Task(future.id().clone()),
        }
    }

    pub fn task_id(&self) -> &TaskId {
        self.future.id()
    }

    /// Start a task discovered while running. Returns the existing future if
    /// the identifier was already started with an equal factory.
    pub fn start_child_task(
        &self,
        id: impl Into<TaskId>,
        factory: Arc<dyn TaskFactory>,
    ) -> EngineResult<TaskFuture> {
        self.engine.start_or_get(&id.into(), factory)
    }

    /// Block until `future` is terminal and return its memoized outcome.
    pub fn await_result(&self, future: &TaskFuture) -> EngineResult<TaskValue> {
        self.ensure_not_self(future.id())?;
        if let Some(outcome) = future.try_result() {
            self.engine.observe(future.id());
            return outcome;
        }
        let _blocked = BlockedSection::enter(self);
        self.engine.await_future(future, &self.tag)
    }

    /// Wait for an identifier without starting it.
    ///
    /// If nobody has started `id` yet, this blocks until somebody does and
    /// the task finishes; if nobody ever does, the build deadlocks.
    pub fn get_task_result(&self, id: impl Into<TaskId>) -> EngineResult<TaskValue> {
        let future = self.engine.registry.get_or_placeholder(&id.into());
        self.await_result(&future)
    }

    /// Start a child and wait for it.
    pub fn run_child_task(
        &self,
        id: impl Into<TaskId>,
        factory: Arc<dyn TaskFactory>,
    ) -> EngineResult<TaskValue> {
        let future = self.start_child_task(id, factory)?;
        self.await_result(&future)
    }

    /// Outcome of a task that must already be finished. Never blocks.
    pub fn finished_result(&self, id: impl Into<TaskId>) -> EngineResult<TaskValue> {
        let id = id.into();
        let outcome = self
            .engine
            .registry
            .get(&id)
            .and_then(|future| future.try_result());
        match outcome {
            Some(outcome) => {
                self.engine.observe(&id);
                outcome
            }
            None => Err(EngineError::IllegalTaskOperation {
                task: id,
                reason: "result requested before the task finished".to_string(),
            }),
        }
    }

    /// Handle to `id` (a placeholder if it was never started).
    pub fn future_of(&self, id: impl Into<TaskId>) -> TaskFuture {
        self.engine.registry.get_or_placeholder(&id.into())
    }

    /// Block until `predicate` accepts the state of `future`.
    ///
    /// The predicate is evaluated immediately and after every change in
    /// `events`. If it fails, the error is returned as `WaitCondition` and
    /// the wait is released like any other.
    pub fn wait_until(
        &self,
        future: &TaskFuture,
        events: Events,
        predicate: impl FnMut(&TaskExecutionState) -> anyhow::Result<bool>,
    ) -> EngineResult<TaskExecutionState> {
        self.ensure_not_self(future.id())?;
        let _blocked = BlockedSection::enter(self);
        self.engine.await_state(future, &self.tag, events, predicate)
    }

    fn ensure_not_self(&self, id: &TaskId) -> EngineResult<()> {
        if id == self.task_id() {
            return Err(EngineError::IllegalTaskOperation {
                task: id.clone(),
                reason: "a task cannot wait for its own result".to_string(),
            });
        }
        Ok(())
    }
}

/// Marks the task `Blocked` and frees its pool slot while it waits.
struct BlockedSection<'c> {
    engine: &'c EngineShared,
    future: &'c TaskFuture,
}

impl<'c> BlockedSection<'c> {
    fn enter(ctx: &'c TaskContext<'_>) -> Self {
        ctx.future.set_blocked(true, &ctx.engine.accounting);
        ctx.engine.pool.worker_blocked();
        Self {
            engine: ctx.engine,
            future: ctx.future,
        }
    }
}

impl Drop for BlockedSection<'_> {
    fn drop(&mut self) {
        self.engine.pool.worker_resumed();
        self.future.set_blocked(false, &self.engine.accounting);
    }
}
