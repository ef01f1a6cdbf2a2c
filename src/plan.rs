// src/plan.rs

//! Turn a validated config into task factories.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::config::model::{ConfigFile, TaskSpec};
use crate::errors::{DynbuildError, Result};
use crate::task::{
    AwaitTaskFactory, ChildStarterTaskFactory, ConcatTaskFactory, ConstantTaskFactory,
    FailingTaskFactory, SequentialStarterTaskFactory, TaskFactory,
};
use crate::types::{TaskId, TaskKind};

/// One factory per `[task.<name>]` section.
#[derive(Debug, Clone, Default)]
pub struct TaskPlan {
    factories: BTreeMap<TaskId, Arc<dyn TaskFactory>>,
}

impl TaskPlan {
    pub fn from_config(cfg: &ConfigFile) -> Result<Self> {
        let mut plan = TaskPlan::default();
        for name in cfg.task.keys() {
            plan.build(name, cfg)?;
        }
        debug!(tasks = plan.factories.len(), "task plan built");
        Ok(plan)
    }

    pub fn factory(&self, name: &str) -> Option<Arc<dyn TaskFactory>> {
        self.factories.get(name).cloned()
    }

    /// Identifier and factory of the task to run first.
    pub fn root(&self, name: &str) -> Result<(TaskId, Arc<dyn TaskFactory>)> {
        self.factories
            .get_key_value(name)
            .map(|(id, factory)| (id.clone(), Arc::clone(factory)))
            .ok_or_else(|| DynbuildError::TaskNotFound(name.to_string()))
    }

    pub fn task_ids(&self) -> impl Iterator<Item = &TaskId> {
        self.factories.keys()
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    // Children are built before their parent; validation guarantees the
    // recursion terminates.
    fn build(&mut self, name: &str, cfg: &ConfigFile) -> Result<Arc<dyn TaskFactory>> {
        if let Some(existing) = self.factories.get(name) {
            return Ok(Arc::clone(existing));
        }
        let spec = cfg
            .task
            .get(name)
            .ok_or_else(|| DynbuildError::TaskNotFound(name.to_string()))?;

        let factory: Arc<dyn TaskFactory> = match spec.kind {
            TaskKind::Constant => Arc::new(ConstantTaskFactory::new(required(
                name,
                "value",
                &spec.value,
            )?)),
            TaskKind::Await => Arc::new(AwaitTaskFactory::new(required(
                name,
                "target",
                &spec.target,
            )?)),
            TaskKind::Concat => Arc::new(ConcatTaskFactory::new(
                spec.prefix.clone().unwrap_or_default(),
                spec.inputs.iter().map(TaskId::new),
            )),
            TaskKind::Children => {
                Arc::new(ChildStarterTaskFactory::new(self.build_children(spec, cfg)?))
            }
            TaskKind::Sequential => Arc::new(SequentialStarterTaskFactory::new(
                self.build_children(spec, cfg)?,
            )),
            TaskKind::Fail => Arc::new(FailingTaskFactory::new(required(
                name,
                "message",
                &spec.message,
            )?)),
        };

        self.factories.insert(TaskId::new(name), Arc::clone(&factory));
        Ok(factory)
    }

    fn build_children(
        &mut self,
        spec: &TaskSpec,
        cfg: &ConfigFile,
    ) -> Result<Vec<(TaskId, Arc<dyn TaskFactory>)>> {
        spec.children
            .iter()
            .map(|child| Ok((TaskId::new(child), self.build(child, cfg)?)))
            .collect()
    }
}

fn required(name: &str, field: &str, value: &Option<String>) -> Result<String> {
    value.clone().ok_or_else(|| {
        DynbuildError::ConfigError(format!("task '{name}' is missing `{field}`"))
    })
}
