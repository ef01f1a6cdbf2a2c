// src/cache/mod.rs

//! Result cache consulted before a task body runs.
//!
//! Entries are keyed by task identifier and factory fingerprint, so a task
//! restarted with a different factory never sees a stale value.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::types::{Fingerprint, TaskId, TaskValue};

pub trait ResultCache: Send + Sync + Debug {
    fn lookup(&self, id: &TaskId, fingerprint: &Fingerprint) -> Option<TaskValue>;

    fn store(&self, id: &TaskId, fingerprint: &Fingerprint, value: &TaskValue);
}

/// Process-local cache shared between successive build executions.
#[derive(Debug, Default)]
pub struct InMemoryResultCache {
    entries: Mutex<HashMap<TaskId, (Fingerprint, TaskValue)>>,
}

impl InMemoryResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.lock().contains_key(id)
    }

    /// Drop the cached result for a task (e.g. because its inputs changed).
    pub fn invalidate(&self, id: &TaskId) {
        if self.lock().remove(id).is_some() {
            debug!(task = %id, "invalidated cached result");
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TaskId, (Fingerprint, TaskValue)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ResultCache for InMemoryResultCache {
    fn lookup(&self, id: &TaskId, fingerprint: &Fingerprint) -> Option<TaskValue> {
        match self.lock().get(id) {
            Some((cached, value)) if cached == fingerprint => Some(value.clone()),
            Some(_) => {
                debug!(task = %id, "cached result has a different fingerprint");
                None
            }
            None => None,
        }
    }

    fn store(&self, id: &TaskId, fingerprint: &Fingerprint, value: &TaskValue) {
        debug!(task = %id, "caching task result");
        self.lock().insert(id.clone(), (*fingerprint, value.clone()));
    }
}
