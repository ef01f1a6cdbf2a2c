// src/config/validate.rs

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::config::model::{ConfigFile, RawConfigFile, TaskSpec};
use crate::errors::{DynbuildError, Result};
use crate::types::TaskKind;

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = DynbuildError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_config(&raw)?;
        Ok(ConfigFile::new_unchecked(raw.engine, raw.task))
    }
}

/// Run every check on a raw config.
pub fn validate_config(cfg: &RawConfigFile) -> Result<()> {
    ensure_has_tasks(cfg)?;
    validate_engine_section(cfg)?;
    for (name, task) in cfg.task.iter() {
        validate_task_fields(name, task)?;
    }
    validate_children_references(cfg)?;
    validate_child_graph(cfg)?;
    Ok(())
}

fn ensure_has_tasks(cfg: &RawConfigFile) -> Result<()> {
    if cfg.task.is_empty() {
        return Err(DynbuildError::ConfigError(
            "config must contain at least one [task.<name>] section".to_string(),
        ));
    }
    Ok(())
}

fn validate_engine_section(cfg: &RawConfigFile) -> Result<()> {
    if cfg.engine.max_workers == 0 {
        return Err(DynbuildError::ConfigError(
            "[engine].max_workers must be >= 1 (got 0)".to_string(),
        ));
    }
    if cfg.engine.thread_name_prefix.trim().is_empty() {
        return Err(DynbuildError::ConfigError(
            "[engine].thread_name_prefix must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn validate_task_fields(name: &str, task: &TaskSpec) -> Result<()> {
    let missing = |field: &str| {
        DynbuildError::ConfigError(format!(
            "task '{}' of kind '{}' requires `{}`",
            name, task.kind, field
        ))
    };

    match task.kind {
        TaskKind::Constant if task.value.is_none() => Err(missing("value")),
        TaskKind::Await if task.target.is_none() => Err(missing("target")),
        TaskKind::Concat if task.inputs.is_empty() => Err(missing("inputs")),
        TaskKind::Children | TaskKind::Sequential if task.children.is_empty() => {
            Err(missing("children"))
        }
        TaskKind::Fail if task.message.is_none() => Err(missing("message")),
        _ => Ok(()),
    }
}

fn validate_children_references(cfg: &RawConfigFile) -> Result<()> {
    for (name, task) in cfg.task.iter() {
        if !task.kind.starts_children() && !task.children.is_empty() {
            return Err(DynbuildError::ConfigError(format!(
                "task '{}' of kind '{}' cannot have `children`",
                name, task.kind
            )));
        }
        for child in task.children.iter() {
            if !cfg.task.contains_key(child) {
                return Err(DynbuildError::ConfigError(format!(
                    "task '{}' has unknown child '{}' in `children`",
                    name, child
                )));
            }
            if child == name {
                return Err(DynbuildError::ConfigError(format!(
                    "task '{}' cannot start itself in `children`",
                    name
                )));
            }
        }
    }
    Ok(())
}

/// Factories embed the factories of their children, so the child-starter
/// graph must be acyclic. Waits (`target`, `inputs`) are not edges here:
/// those are discovered at run time and a cycle among them is a deadlock the
/// engine reports.
fn validate_child_graph(cfg: &RawConfigFile) -> Result<()> {
    // Edge direction: child -> parent
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();

    for name in cfg.task.keys() {
        graph.add_node(name.as_str());
    }

    for (name, task) in cfg.task.iter() {
        for child in task.children.iter() {
            graph.add_edge(child.as_str(), name.as_str(), ());
        }
    }

    match toposort(&graph, None) {
        Ok(_order) => Ok(()),
        Err(cycle) => {
            let node = cycle.node_id();
            Err(DynbuildError::PlanCycle(format!(
                "cycle detected in `children` involving task '{}'",
                node
            )))
        }
    }
}
