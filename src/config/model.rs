// src/config/model.rs

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

use crate::engine::EngineOptions;
use crate::types::TaskKind;

/// Configuration as read from a TOML file, before validation.
///
/// ```toml
/// [engine]
/// max_workers = 4
///
/// [task.str]
/// kind = "constant"
/// value = "str"
///
/// [task.waiter]
/// kind = "await"
/// target = "str"
///
/// [task.main]
/// kind = "sequential"
/// children = ["str", "waiter"]
/// ```
///
/// All sections are optional at this stage; [`ConfigFile`] is the validated
/// form used by the rest of the application.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawConfigFile {
    /// Engine tuning from `[engine]`.
    #[serde(default)]
    pub engine: EngineSection,

    /// All tasks from `[task.<name>]`, keyed by task name.
    #[serde(default)]
    pub task: BTreeMap<String, TaskSpec>,
}

/// Validated configuration. Build one with `ConfigFile::try_from(raw)`.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub engine: EngineSection,
    pub task: BTreeMap<String, TaskSpec>,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(engine: EngineSection, task: BTreeMap<String, TaskSpec>) -> Self {
        Self { engine, task }
    }
}

/// `[engine]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSection {
    /// Upper bound on concurrently active task bodies.
    ///
    /// Workers blocked on a dependency do not count against it.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Milliseconds an idle worker thread waits for new work before exiting.
    #[serde(default = "default_keep_alive_ms")]
    pub keep_alive_ms: u64,

    #[serde(default = "default_thread_name_prefix")]
    pub thread_name_prefix: String,
}

fn default_max_workers() -> usize {
    std::thread::available_parallelism().map_or(4, |n| n.get())
}

fn default_keep_alive_ms() -> u64 {
    5_000
}

fn default_thread_name_prefix() -> String {
    "dynbuild-worker".to_string()
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            keep_alive_ms: default_keep_alive_ms(),
            thread_name_prefix: default_thread_name_prefix(),
        }
    }
}

impl From<&EngineSection> for EngineOptions {
    fn from(section: &EngineSection) -> Self {
        EngineOptions {
            max_workers: section.max_workers,
            keep_alive: Duration::from_millis(section.keep_alive_ms),
            thread_name_prefix: section.thread_name_prefix.clone(),
        }
    }
}

/// `[task.<name>]` section.
///
/// Which fields are required depends on `kind`; see [`TaskKind`].
#[derive(Debug, Clone, Deserialize)]
pub struct TaskSpec {
    pub kind: TaskKind,

    /// Result of a `constant` task.
    #[serde(default)]
    pub value: Option<String>,

    /// Identifier an `await` task waits for. It does not have to be a task of
    /// this plan; waiting for an identifier nobody starts deadlocks the build.
    #[serde(default)]
    pub target: Option<String>,

    /// Identifiers a `concat` task waits for, in order.
    #[serde(default)]
    pub inputs: Vec<String>,

    /// Text a `concat` task puts before its inputs.
    #[serde(default)]
    pub prefix: Option<String>,

    /// Plan tasks started by `children` and `sequential` tasks, in order.
    #[serde(default)]
    pub children: Vec<String>,

    /// Error message of a `fail` task.
    #[serde(default)]
    pub message: Option<String>,
}

impl TaskSpec {
    pub fn new(kind: TaskKind) -> Self {
        Self {
            kind,
            value: None,
            target: None,
            inputs: Vec::new(),
            prefix: None,
            children: Vec::new(),
            message: None,
        }
    }
}
