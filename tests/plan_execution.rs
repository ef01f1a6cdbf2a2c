// tests/plan_execution.rs

use std::io::Write;
use std::sync::Arc;

use dynbuild::cache::InMemoryResultCache;
use dynbuild::cli::CliArgs;
use dynbuild::config::{load_and_validate, parse_str};
use dynbuild::engine::{BuildEngine, EngineOptions};
use dynbuild::errors::EngineError;
use dynbuild::plan::TaskPlan;
use dynbuild::types::TaskId;
use dynbuild_test_utils::builders::{ConfigFileBuilder, TaskSpecBuilder};
use dynbuild_test_utils::{init_tracing, with_deadline, with_timeout};
use tempfile::NamedTempFile;

const PLAN: &str = r#"
[engine]
max_workers = 2
keep_alive_ms = 200

[task.str]
kind = "constant"
value = "str"

[task.waiter]
kind = "await"
target = "str"

[task.seq]
kind = "sequential"
children = ["str", "waiter"]

[task.main]
kind = "sequential"
children = ["seq"]

[task.report]
kind = "concat"
prefix = "result="
inputs = ["main"]

[task.all]
kind = "children"
children = ["report", "main"]

[task.broken]
kind = "sequential"
children = ["boom"]

[task.boom]
kind = "fail"
message = "no space left"
"#;

fn engine_for(plan_text: &str) -> (TaskPlan, BuildEngine) {
    let raw = parse_str(plan_text).unwrap();
    let cfg = raw.try_into().unwrap();
    let plan = TaskPlan::from_config(&cfg).unwrap();
    let engine = BuildEngine::new(EngineOptions::from(&cfg.engine));
    (plan, engine)
}

#[test]
fn config_plan_runs_end_to_end() {
    init_tracing();
    let (plan, engine) = engine_for(PLAN);
    assert_eq!(plan.len(), 8);

    let (root, factory) = plan.root("main").unwrap();
    let value = with_deadline({
        let engine = engine.clone();
        move || engine.run_and_wait(root, factory)
    })
    .unwrap();

    assert_eq!(value.as_str(), Some("strstr"));
    assert_eq!(engine.report().executions_of("str"), 1);
}

#[test]
fn concat_task_waits_for_a_sibling_started_later() {
    init_tracing();
    let (plan, engine) = engine_for(PLAN);
    let (root, factory) = plan.root("all").unwrap();

    with_deadline({
        let engine = engine.clone();
        move || engine.run_and_wait(root, factory)
    })
    .unwrap();

    let report = engine.future("report").unwrap().try_result().unwrap().unwrap();
    assert_eq!(report.as_str(), Some("result=strstr"));
}

#[test]
fn failing_plan_task_fails_the_build() {
    init_tracing();
    let (plan, engine) = engine_for(PLAN);
    let (root, factory) = plan.root("broken").unwrap();

    let err = with_deadline(move || engine.run_and_wait(root, factory)).unwrap_err();
    match err.root_cause() {
        EngineError::TaskFailed { task, cause } => {
            assert_eq!(task, &TaskId::new("boom"));
            assert_eq!(cause.to_string(), "no space left");
        }
        other => panic!("expected boom to be the root cause, got {other:?}"),
    }
}

#[test]
fn await_of_an_undeclared_identifier_deadlocks() {
    init_tracing();
    let cfg = ConfigFileBuilder::new()
        .with_max_workers(2)
        .with_task("waiter", TaskSpecBuilder::awaiting("nowhere").build())
        .with_task("main", TaskSpecBuilder::sequential(&["waiter"]).build())
        .build();
    let plan = TaskPlan::from_config(&cfg).unwrap();
    let engine = BuildEngine::new(EngineOptions::from(&cfg.engine));
    let (root, factory) = plan.root("main").unwrap();

    let err = with_deadline({
        let engine = engine.clone();
        move || engine.run_and_wait(root, factory)
    })
    .unwrap_err();

    assert!(err.involves_deadlock(), "{err:?}");
    let report = engine.deadlock_report().unwrap();
    assert_eq!(report.never_started, vec![TaskId::new("nowhere")]);
}

#[test]
fn plan_factories_are_stable_across_loads() {
    let (first, _) = engine_for(PLAN);
    let (second, _) = engine_for(PLAN);
    for id in first.task_ids() {
        let a = first.factory(id.as_str()).unwrap();
        let b = second.factory(id.as_str()).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint(), "task {id}");
    }
}

#[test]
fn shared_cache_skips_work_on_the_second_engine() {
    init_tracing();
    let cache = Arc::new(InMemoryResultCache::new());
    let (plan, _) = engine_for(PLAN);

    for run in 0..2 {
        let engine = BuildEngine::with_cache(EngineOptions::default(), cache.clone());
        let (root, factory) = plan.root("main").unwrap();
        let value = with_deadline({
            let engine = engine.clone();
            move || engine.run_and_wait(root, factory)
        })
        .unwrap();
        assert_eq!(value.as_str(), Some("strstr"));

        let executed = engine.report().executed.len();
        if run == 0 {
            assert_eq!(executed, 4);
        } else {
            assert_eq!(executed, 0);
        }
    }
}

#[tokio::test]
async fn run_executes_the_configured_task() {
    init_tracing();
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "{PLAN}").unwrap();
    assert!(load_and_validate(file.path()).is_ok());

    let args = CliArgs {
        config: Some(file.path().display().to_string()),
        task: "main".to_string(),
        log_level: None,
        dry_run: false,
        max_workers: Some(1),
        runs: 2,
    };
    with_timeout(dynbuild::run(args)).await.unwrap();
}

#[tokio::test]
async fn run_reports_a_missing_root() {
    init_tracing();
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "{PLAN}").unwrap();

    let args = CliArgs {
        config: Some(file.path().display().to_string()),
        task: "nope".to_string(),
        log_level: None,
        dry_run: false,
        max_workers: None,
        runs: 1,
    };
    let err = with_timeout(dynbuild::run(args)).await.unwrap_err();
    assert!(err.to_string().contains("nope"));
}
