#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use dynbuild::config::{ConfigFile, EngineSection, RawConfigFile, TaskSpec};
use dynbuild::engine::{BuildEngine, EngineOptions};
use dynbuild::task::{
    AwaitTaskFactory, ConstantTaskFactory, SequentialStarterTaskFactory, TaskFactory,
};
use dynbuild::types::{TaskId, TaskKind};

/// Builder for `ConfigFile` to simplify test setup.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        Self {
            config: RawConfigFile {
                engine: EngineSection::default(),
                task: BTreeMap::new(),
            },
        }
    }

    pub fn with_task(mut self, name: &str, task: TaskSpec) -> Self {
        self.config.task.insert(name.to_string(), task);
        self
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.config.engine.max_workers = max_workers;
        self
    }

    pub fn build_raw(self) -> RawConfigFile {
        self.config
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.config).expect("Failed to build valid config from builder")
    }
}

impl Default for ConfigFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `TaskSpec`.
pub struct TaskSpecBuilder {
    task: TaskSpec,
}

impl TaskSpecBuilder {
    pub fn new(kind: TaskKind) -> Self {
        Self {
            task: TaskSpec::new(kind),
        }
    }

    /// Kind given by name, as it would appear in TOML.
    pub fn kind(kind: &str) -> Self {
        Self::new(kind.parse().expect("valid task kind"))
    }

    pub fn constant(value: &str) -> Self {
        Self::new(TaskKind::Constant).value(value)
    }

    pub fn awaiting(target: &str) -> Self {
        Self::new(TaskKind::Await).target(target)
    }

    pub fn sequential(children: &[&str]) -> Self {
        children
            .iter()
            .fold(Self::new(TaskKind::Sequential), |b, c| b.child(c))
    }

    pub fn children(children: &[&str]) -> Self {
        children
            .iter()
            .fold(Self::new(TaskKind::Children), |b, c| b.child(c))
    }

    pub fn value(mut self, value: &str) -> Self {
        self.task.value = Some(value.to_string());
        self
    }

    pub fn target(mut self, target: &str) -> Self {
        self.task.target = Some(target.to_string());
        self
    }

    pub fn input(mut self, input: &str) -> Self {
        self.task.inputs.push(input.to_string());
        self
    }

    pub fn prefix(mut self, prefix: &str) -> Self {
        self.task.prefix = Some(prefix.to_string());
        self
    }

    pub fn child(mut self, child: &str) -> Self {
        self.task.children.push(child.to_string());
        self
    }

    pub fn message(mut self, message: &str) -> Self {
        self.task.message = Some(message.to_string());
        self
    }

    pub fn build(self) -> TaskSpec {
        self.task
    }
}

/// Engine with a small, fixed worker bound so tests behave the same on any
/// machine.
pub fn test_engine(max_workers: usize) -> BuildEngine {
    BuildEngine::new(EngineOptions::default().with_max_workers(max_workers))
}

pub fn constant(value: &str) -> Arc<dyn TaskFactory> {
    Arc::new(ConstantTaskFactory::new(value))
}

pub fn awaiting(target: &str) -> Arc<dyn TaskFactory> {
    Arc::new(AwaitTaskFactory::new(target))
}

pub fn sequential(children: Vec<(&str, Arc<dyn TaskFactory>)>) -> Arc<dyn TaskFactory> {
    Arc::new(SequentialStarterTaskFactory::new(
        children
            .into_iter()
            .map(|(id, factory)| (TaskId::new(id), factory)),
    ))
}
