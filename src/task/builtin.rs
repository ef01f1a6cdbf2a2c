// src/task/builtin.rs

//! Built-in factories used by task plans.
//!
//! String results are concatenated by the composite factories, which keeps
//! plans easy to check from the command line.

use std::sync::Arc;

use anyhow::{Context, anyhow};
use tracing::debug;

use crate::engine::TaskContext;
use crate::task::{Task, TaskFactory};
use crate::types::{Fingerprint, TaskId, TaskValue};

/// Returns a fixed string.
#[derive(Debug, Clone)]
pub struct ConstantTaskFactory {
    value: String,
}

impl ConstantTaskFactory {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }
}

impl TaskFactory for ConstantTaskFactory {
    fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(["constant", self.value.as_str()])
    }

    fn create_task(&self, _id: &TaskId) -> Box<dyn Task> {
        Box::new(ConstantTask {
            value: self.value.clone(),
        })
    }
}

struct ConstantTask {
    value: String,
}

impl Task for ConstantTask {
    fn run(&mut self, _ctx: &TaskContext<'_>) -> anyhow::Result<TaskValue> {
        Ok(TaskValue::string(self.value.clone()))
    }
}

/// Waits for another identifier (without starting it) and returns its result.
#[derive(Debug, Clone)]
pub struct AwaitTaskFactory {
    target: TaskId,
}

impl AwaitTaskFactory {
    pub fn new(target: impl Into<TaskId>) -> Self {
        Self {
            target: target.into(),
        }
    }
}

impl TaskFactory for AwaitTaskFactory {
    fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(["await", self.target.as_str()])
    }

    fn create_task(&self, _id: &TaskId) -> Box<dyn Task> {
        Box::new(AwaitTask {
            target: self.target.clone(),
        })
    }
}

struct AwaitTask {
    target: TaskId,
}

impl Task for AwaitTask {
    fn run(&mut self, ctx: &TaskContext<'_>) -> anyhow::Result<TaskValue> {
        let value = ctx
            .get_task_result(self.target.clone())
            .with_context(|| format!("waiting for '{}'", self.target))?;
        Ok(value)
    }
}

/// Waits for every input in order and concatenates `prefix` with their
/// string results.
#[derive(Debug, Clone)]
pub struct ConcatTaskFactory {
    prefix: String,
    inputs: Vec<TaskId>,
}

impl ConcatTaskFactory {
    pub fn new(prefix: impl Into<String>, inputs: impl IntoIterator<Item = TaskId>) -> Self {
        Self {
            prefix: prefix.into(),
            inputs: inputs.into_iter().collect(),
        }
    }
}

impl TaskFactory for ConcatTaskFactory {
    fn fingerprint(&self) -> Fingerprint {
        let mut parts = vec!["concat", self.prefix.as_str()];
        parts.extend(self.inputs.iter().map(TaskId::as_str));
        Fingerprint::of(parts)
    }

    fn create_task(&self, _id: &TaskId) -> Box<dyn Task> {
        Box::new(ConcatTask {
            prefix: self.prefix.clone(),
            inputs: self.inputs.clone(),
        })
    }
}

struct ConcatTask {
    prefix: String,
    inputs: Vec<TaskId>,
}

impl Task for ConcatTask {
    fn run(&mut self, ctx: &TaskContext<'_>) -> anyhow::Result<TaskValue> {
        let mut out = self.prefix.clone();
        for input in &self.inputs {
            let value = ctx.get_task_result(input.clone())?;
            out.push_str(&string_result(input, &value)?);
        }
        Ok(TaskValue::string(out))
    }
}

/// A child identifier together with the factory to start it with.
pub type ChildSpec = (TaskId, Arc<dyn TaskFactory>);

fn children_fingerprint(kind: &str, children: &[ChildSpec]) -> Fingerprint {
    let mut parts: Vec<Vec<u8>> = vec![kind.as_bytes().to_vec()];
    for (id, factory) in children {
        parts.push(id.as_str().as_bytes().to_vec());
        parts.push(factory.fingerprint().as_bytes().to_vec());
    }
    Fingerprint::of(parts)
}

/// Starts every child without waiting for any of them.
///
/// The result is the list of started identifiers.
#[derive(Debug, Clone)]
pub struct ChildStarterTaskFactory {
    children: Vec<ChildSpec>,
}

impl ChildStarterTaskFactory {
    pub fn new(children: impl IntoIterator<Item = ChildSpec>) -> Self {
        Self {
            children: children.into_iter().collect(),
        }
    }
}

impl TaskFactory for ChildStarterTaskFactory {
    fn fingerprint(&self) -> Fingerprint {
        children_fingerprint("children", &self.children)
    }

    fn create_task(&self, _id: &TaskId) -> Box<dyn Task> {
        Box::new(ChildStarterTask {
            children: self.children.clone(),
        })
    }
}

struct ChildStarterTask {
    children: Vec<ChildSpec>,
}

impl Task for ChildStarterTask {
    fn run(&mut self, ctx: &TaskContext<'_>) -> anyhow::Result<TaskValue> {
        let mut started = Vec::with_capacity(self.children.len());
        for (id, factory) in &self.children {
            ctx.start_child_task(id.clone(), Arc::clone(factory))?;
            started.push(id.clone());
        }
        debug!(task = %ctx.task_id(), children = started.len(), "started child tasks");
        Ok(TaskValue::new(started))
    }
}

/// Starts each child and waits for it before starting the next one.
///
/// The result is the concatenation of the children's string results, so the
/// order of `children` is observable.
#[derive(Debug, Clone)]
pub struct SequentialStarterTaskFactory {
    children: Vec<ChildSpec>,
}

impl SequentialStarterTaskFactory {
    pub fn new(children: impl IntoIterator<Item = ChildSpec>) -> Self {
        Self {
            children: children.into_iter().collect(),
        }
    }
}

impl TaskFactory for SequentialStarterTaskFactory {
    fn fingerprint(&self) -> Fingerprint {
        children_fingerprint("sequential", &self.children)
    }

    fn create_task(&self, _id: &TaskId) -> Box<dyn Task> {
        Box::new(SequentialStarterTask {
            children: self.children.clone(),
        })
    }
}

struct SequentialStarterTask {
    children: Vec<ChildSpec>,
}

impl Task for SequentialStarterTask {
    fn run(&mut self, ctx: &TaskContext<'_>) -> anyhow::Result<TaskValue> {
        let mut out = String::new();
        for (id, factory) in &self.children {
            let value = ctx.run_child_task(id.clone(), Arc::clone(factory))?;
            out.push_str(&string_result(id, &value)?);
        }
        Ok(TaskValue::string(out))
    }
}

/// Always fails with `message`.
#[derive(Debug, Clone)]
pub struct FailingTaskFactory {
    message: String,
}

impl FailingTaskFactory {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl TaskFactory for FailingTaskFactory {
    fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(["fail", self.message.as_str()])
    }

    fn create_task(&self, _id: &TaskId) -> Box<dyn Task> {
        Box::new(FailingTask {
            message: self.message.clone(),
        })
    }
}

struct FailingTask {
    message: String,
}

impl Task for FailingTask {
    fn run(&mut self, _ctx: &TaskContext<'_>) -> anyhow::Result<TaskValue> {
        Err(anyhow!("{}", self.message))
    }
}

/// Render a child's result for concatenation.
fn string_result(id: &TaskId, value: &TaskValue) -> anyhow::Result<String> {
    if let Some(s) = value.as_str() {
        return Ok(s.to_string());
    }
    if let Some(ids) = value.downcast_ref::<Vec<TaskId>>() {
        let names: Vec<&str> = ids.iter().map(TaskId::as_str).collect();
        return Ok(names.join(","));
    }
    Err(anyhow!("task '{id}' did not produce a string result"))
}
