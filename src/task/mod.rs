// src/task/mod.rs

//! Task factories and task bodies.
//!
//! A [`TaskFactory`] describes a task: its fingerprint says which factory it
//! is (for duplicate detection and result caching), and `create_task` builds
//! the body that runs on a worker. Bodies discover their dependencies while
//! running, through the [`TaskContext`] they are given.

pub mod builtin;

use std::fmt;
use std::sync::Arc;

use crate::engine::TaskContext;
use crate::types::{Fingerprint, TaskId, TaskValue};

pub use builtin::{
    AwaitTaskFactory, ChildStarterTaskFactory, ConcatTaskFactory, ConstantTaskFactory,
    FailingTaskFactory, SequentialStarterTaskFactory,
};

pub trait TaskFactory: Send + Sync + fmt::Debug + 'static {
    fn fingerprint(&self) -> Fingerprint;

    fn create_task(&self, id: &TaskId) -> Box<dyn Task>;
}

pub trait Task: Send {
    fn run(&mut self, ctx: &TaskContext<'_>) -> anyhow::Result<TaskValue>;
}

type TaskFn = dyn Fn(&TaskContext<'_>) -> anyhow::Result<TaskValue> + Send + Sync;

/// Factory wrapping a closure.
///
/// The fingerprint is derived from `label` only, so two closures with the
/// same label are treated as the same factory.
#[derive(Clone)]
pub struct FnTaskFactory {
    label: String,
    body: Arc<TaskFn>,
}

impl FnTaskFactory {
    pub fn new<F>(label: impl Into<String>, body: F) -> Self
    where
        F: Fn(&TaskContext<'_>) -> anyhow::Result<TaskValue> + Send + Sync + 'static,
    {
        Self {
            label: label.into(),
            body: Arc::new(body),
        }
    }

    pub fn shared<F>(label: impl Into<String>, body: F) -> Arc<dyn TaskFactory>
    where
        F: Fn(&TaskContext<'_>) -> anyhow::Result<TaskValue> + Send + Sync + 'static,
    {
        Arc::new(Self::new(label, body))
    }
}

impl fmt::Debug for FnTaskFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTaskFactory")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

impl TaskFactory for FnTaskFactory {
    fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(["fn", self.label.as_str()])
    }

    fn create_task(&self, _id: &TaskId) -> Box<dyn Task> {
        Box::new(FnTask {
            body: Arc::clone(&self.body),
        })
    }
}

struct FnTask {
    body: Arc<TaskFn>,
}

impl Task for FnTask {
    fn run(&mut self, ctx: &TaskContext<'_>) -> anyhow::Result<TaskValue> {
        (self.body)(ctx)
    }
}
