// src/engine/registry.rs

//! Identifier -> future map of one build execution.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, trace};

use crate::engine::accounting::WaiterAccounting;
use crate::engine::future::{Claim, TaskFuture};
use crate::errors::EngineResult;
use crate::task::TaskFactory;
use crate::types::TaskId;

#[derive(Debug, Default)]
pub struct TaskGraphRegistry {
    futures: Mutex<HashMap<TaskId, TaskFuture>>,
}

impl TaskGraphRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the future for `id`, creating a `NotStarted` placeholder if the
    /// identifier has never been seen.
    pub fn get_or_placeholder(&self, id: &TaskId) -> TaskFuture {
        let mut futures = self.lock();
        futures
            .entry(id.clone())
            .or_insert_with(|| {
                trace!(task = %id, "created placeholder future");
                TaskFuture::new(id.clone())
            })
            .clone()
    }

    pub fn get(&self, id: &TaskId) -> Option<TaskFuture> {
        self.lock().get(id).cloned()
    }

    /// Start `id` with `factory` unless it was already started.
    ///
    /// The caller that wins the `NotStarted -> Running` transition runs
    /// `launch`, which is expected to either schedule the body or complete
    /// the future directly. Everybody else gets the existing future back.
    /// Restarting an identifier with a different factory fingerprint fails
    /// with `DuplicateTaskIdentifier`.
    pub fn start_or_get(
        &self,
        id: &TaskId,
        factory: &Arc<dyn TaskFactory>,
        accounting: &WaiterAccounting,
        launch: impl FnOnce(&TaskFuture),
    ) -> EngineResult<TaskFuture> {
        let future = self.get_or_placeholder(id);
        match future.claim(factory.fingerprint(), accounting)? {
            Claim::Won => {
                debug!(task = %id, "task claimed for execution");
                launch(&future);
            }
            Claim::Existing => {
                trace!(task = %id, "task already started; reusing future");
            }
        }
        Ok(future)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// All futures, sorted by identifier.
    pub fn snapshot(&self) -> Vec<TaskFuture> {
        let mut futures: Vec<TaskFuture> = self.lock().values().cloned().collect();
        futures.sort_by(|a, b| a.id().cmp(b.id()));
        futures
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TaskId, TaskFuture>> {
        self.futures.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
