// tests/memoization.rs

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use anyhow::bail;
use dynbuild::engine::WaiterCounts;
use dynbuild::errors::EngineError;
use dynbuild::task::{ChildStarterTaskFactory, FailingTaskFactory, FnTaskFactory, TaskFactory};
use dynbuild::types::{TaskId, TaskValue};
use dynbuild_test_utils::builders::{constant, test_engine};
use dynbuild_test_utils::recorder::{ExecutionRecorder, Gate, GateTaskFactory};
use dynbuild_test_utils::{init_tracing, with_deadline};

#[test]
fn concurrent_starts_share_one_execution() {
    init_tracing();
    let engine = test_engine(4);
    let recorder = ExecutionRecorder::new();
    let gate = Gate::new();
    let factory = recorder.wrap(GateTaskFactory::new("once", &gate));

    let barrier = Arc::new(Barrier::new(8));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let engine = engine.clone();
            let factory = Arc::clone(&factory);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                engine.start_or_get("shared", factory).unwrap()
            })
        })
        .collect();
    let futures: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(futures.windows(2).all(|w| w[0].ptr_eq(&w[1])));
    assert!(gate.wait_entered(1, Duration::from_secs(5)));
    gate.open();

    let first = futures[0].clone();
    let value = with_deadline({
        let engine = engine.clone();
        move || engine.await_result(&first)
    })
    .unwrap();
    assert_eq!(value.as_str(), Some("once"));
    for future in &futures {
        let again = future.try_result().unwrap().unwrap();
        assert!(again.ptr_eq(&value));
    }

    engine.wait_idle().unwrap();
    assert_eq!(recorder.count("shared"), 1);
    assert_eq!(gate.entered(), 1);
}

#[test]
fn many_parents_share_one_child() {
    init_tracing();
    let engine = test_engine(3);
    let recorder = ExecutionRecorder::new();
    let child = recorder.wrap(constant("x"));

    let parents: Vec<(TaskId, Arc<dyn TaskFactory>)> = (0..10)
        .map(|i| {
            let child = Arc::clone(&child);
            let parent = FnTaskFactory::shared(format!("parent{i}"), move |ctx| {
                let value = ctx.run_child_task("child", Arc::clone(&child))?;
                Ok(value)
            });
            (TaskId::new(format!("parent{i}")), parent)
        })
        .collect();
    let main: Arc<dyn TaskFactory> = Arc::new(ChildStarterTaskFactory::new(parents));

    with_deadline({
        let engine = engine.clone();
        move || engine.run_and_wait("main", main)
    })
    .unwrap();

    let report = engine.report();
    assert_eq!(recorder.count("child"), 1);
    assert_eq!(report.executions_of("child"), 1);
    for i in 0..10 {
        let parent = engine.future(format!("parent{i}")).unwrap();
        let value = parent.try_result().unwrap().unwrap();
        assert_eq!(value.as_str(), Some("x"));
    }
    assert_eq!(report.counts, WaiterCounts::default());
}

#[test]
fn failure_is_memoized_and_returned_to_every_waiter() {
    init_tracing();
    let engine = test_engine(2);
    let recorder = ExecutionRecorder::new();
    let boom = recorder.wrap(Arc::new(FailingTaskFactory::new("kaput")));

    let main: Arc<dyn TaskFactory> = FnTaskFactory::shared("main", move |ctx| {
        let future = ctx.start_child_task("boom", Arc::clone(&boom))?;
        let first = ctx.await_result(&future);
        let second = ctx.run_child_task("boom", Arc::clone(&boom));
        let mut seen = Vec::new();
        for outcome in [first, second] {
            match outcome {
                Err(EngineError::TaskFailed { task, cause }) => {
                    seen.push(format!("{task}: {cause}"));
                }
                other => bail!("expected boom to fail, got {other:?}"),
            }
        }
        Ok(TaskValue::new(seen))
    });

    let value = with_deadline({
        let engine = engine.clone();
        move || engine.run_and_wait("main", main)
    })
    .unwrap();

    let seen = value.downcast_ref::<Vec<String>>().unwrap();
    assert_eq!(seen, &vec!["boom: kaput".to_string(), "boom: kaput".to_string()]);
    assert_eq!(recorder.count("boom"), 1);

    let report = engine.report();
    assert_eq!(report.failed, vec![TaskId::new("boom")]);
    assert!(report.unobserved_failures.is_empty());
}

#[test]
fn failed_dependency_propagates_to_the_top() {
    init_tracing();
    let engine = test_engine(2);
    let main: Arc<dyn TaskFactory> = FnTaskFactory::shared("main", |ctx| {
        let value = ctx.run_child_task("boom", Arc::new(FailingTaskFactory::new("disk full")))?;
        Ok(value)
    });

    let err = with_deadline(move || engine.run_and_wait("main", main)).unwrap_err();
    match &err {
        EngineError::TaskFailed { task, .. } => assert_eq!(task.as_str(), "main"),
        other => panic!("expected main to fail, got {other:?}"),
    }
    match err.root_cause() {
        EngineError::TaskFailed { task, cause } => {
            assert_eq!(task.as_str(), "boom");
            assert_eq!(cause.to_string(), "disk full");
        }
        other => panic!("expected boom as root cause, got {other:?}"),
    }
    assert!(!err.involves_deadlock());
}

#[test]
fn restarting_with_another_factory_is_rejected() {
    init_tracing();
    let engine = test_engine(2);

    let first = engine.start_or_get("x", constant("a")).unwrap();
    let same = engine.start_or_get("x", constant("a")).unwrap();
    assert!(first.ptr_eq(&same));

    match engine.start_or_get("x", constant("b")) {
        Err(EngineError::DuplicateTaskIdentifier { task }) => assert_eq!(task.as_str(), "x"),
        other => panic!("expected duplicate identifier, got {other:?}"),
    }

    let value = with_deadline({
        let engine = engine.clone();
        move || engine.await_result(&first)
    })
    .unwrap();
    assert_eq!(value.as_str(), Some("a"));
    assert_eq!(engine.report().executions_of("x"), 1);
}

#[test]
fn panicking_body_becomes_a_task_failure() {
    init_tracing();
    let engine = test_engine(1);
    let main: Arc<dyn TaskFactory> =
        FnTaskFactory::shared("main", |_ctx| panic!("body exploded"));

    let err = with_deadline({
        let engine = engine.clone();
        move || engine.run_and_wait("main", main)
    })
    .unwrap_err();

    match err {
        EngineError::TaskFailed { task, cause } => {
            assert_eq!(task.as_str(), "main");
            assert!(cause.to_string().contains("task panicked: body exploded"));
        }
        other => panic!("expected TaskFailed, got {other:?}"),
    }
    assert_eq!(engine.waiter_counts(), WaiterCounts::default());

    // The worker that caught the panic keeps serving jobs.
    let after = engine.start_or_get("after", constant("still alive")).unwrap();
    let value = with_deadline(move || engine.await_result(&after)).unwrap();
    assert_eq!(value.as_str(), Some("still alive"));
}

#[test]
fn failure_nobody_awaited_is_reported() {
    init_tracing();
    let engine = test_engine(2);
    let main: Arc<dyn TaskFactory> = Arc::new(ChildStarterTaskFactory::new([(
        TaskId::new("orphan"),
        Arc::new(FailingTaskFactory::new("ignored")) as Arc<dyn TaskFactory>,
    )]));

    let value = with_deadline({
        let engine = engine.clone();
        move || engine.run_and_wait("main", main)
    })
    .unwrap();

    assert_eq!(
        value.downcast_ref::<Vec<TaskId>>(),
        Some(&vec![TaskId::new("orphan")])
    );
    let report = engine.report();
    assert_eq!(report.unobserved_failures, vec![TaskId::new("orphan")]);
    assert!(!report.deadlocked);
}
