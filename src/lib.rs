// src/lib.rs

pub mod cache;
pub mod cli;
pub mod config;
pub mod engine;
pub mod errors;
pub mod logging;
pub mod plan;
pub mod task;
pub mod types;

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info};

use crate::cache::InMemoryResultCache;
use crate::cli::CliArgs;
use crate::config::loader::load_and_validate;
use crate::config::model::ConfigFile;
use crate::engine::{BuildEngine, EngineOptions};
use crate::plan::TaskPlan;
use crate::types::TaskValue;

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading and validation
/// - the task plan (one factory per configured task)
/// - one build engine per run, sharing a result cache
pub async fn run(args: CliArgs) -> Result<()> {
    let cfg = load_and_validate(args.config_path())?;

    if args.dry_run {
        print_dry_run(&cfg);
        return Ok(());
    }

    let plan = TaskPlan::from_config(&cfg)?;
    let (root, factory) = plan.root(&args.task)?;

    let mut options = EngineOptions::from(&cfg.engine);
    if let Some(max_workers) = args.max_workers {
        options.max_workers = usize::try_from(max_workers)?;
    }

    let cache = Arc::new(InMemoryResultCache::new());
    for run in 1..=args.runs {
        let engine = BuildEngine::with_cache(options.clone(), cache.clone());
        let value = engine
            .run_and_wait_async(root.clone(), Arc::clone(&factory))
            .await?;

        let report = engine.report();
        info!(
            run,
            executed = report.executed.len(),
            cache_hits = report.cache_hits.len(),
            threads = report.pool.spawned_total,
            "run complete"
        );
        println!("{}", render_value(&value));
    }

    Ok(())
}

fn render_value(value: &TaskValue) -> String {
    if let Some(s) = value.as_str() {
        return s.to_string();
    }
    format!("{value:?}")
}

/// Simple dry-run output: print engine settings and tasks.
fn print_dry_run(cfg: &ConfigFile) {
    println!("dynbuild dry-run");
    println!("  engine.max_workers = {}", cfg.engine.max_workers);
    println!("  engine.keep_alive_ms = {}", cfg.engine.keep_alive_ms);
    println!();

    println!("tasks ({}):", cfg.task.len());
    for (name, task) in cfg.task.iter() {
        println!("  - {name} ({})", task.kind);
        if let Some(ref value) = task.value {
            println!("      value: {value:?}");
        }
        if let Some(ref target) = task.target {
            println!("      target: {target}");
        }
        if let Some(ref prefix) = task.prefix {
            println!("      prefix: {prefix:?}");
        }
        if !task.inputs.is_empty() {
            println!("      inputs: {:?}", task.inputs);
        }
        if !task.children.is_empty() {
            println!("      children: {:?}", task.children);
        }
        if let Some(ref message) = task.message {
            println!("      message: {message:?}");
        }
    }

    debug!("dry-run complete (no execution)");
}
