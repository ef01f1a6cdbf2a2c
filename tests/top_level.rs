// tests/top_level.rs

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use dynbuild::engine::{TaskExecutionState, WaiterCounts};
use dynbuild::errors::EngineError;
use dynbuild::task::{ChildStarterTaskFactory, ConcatTaskFactory, FailingTaskFactory, TaskFactory};
use dynbuild::types::TaskId;
use dynbuild_test_utils::builders::{awaiting, constant, sequential, test_engine};
use dynbuild_test_utils::recorder::{ExecutionRecorder, Gate, GateTaskFactory};
use dynbuild_test_utils::{eventually, init_tracing, with_deadline, with_timeout};

#[test]
fn main_starts_and_awaits_a_nested_child() {
    init_tracing();
    let engine = test_engine(2);
    let seq = sequential(vec![("str", constant("str")), ("waiter", awaiting("str"))]);
    let main = sequential(vec![("seq", seq)]);

    let value = with_deadline({
        let engine = engine.clone();
        move || engine.run_and_wait("main", main)
    })
    .unwrap();

    assert_eq!(value.as_str(), Some("strstr"));
    let report = engine.report();
    for id in ["main", "seq", "str", "waiter"] {
        assert_eq!(report.executions_of(id), 1, "task {id}");
    }
    assert_eq!(report.counts, WaiterCounts::default());
    let seq = engine.future("seq").unwrap().state().outcome().unwrap().unwrap();
    assert_eq!(seq.as_str(), Some("strstr"));
}

#[test]
fn concat_waits_for_inputs_started_elsewhere() {
    init_tracing();
    let engine = test_engine(2);
    let concat: Arc<dyn TaskFactory> = Arc::new(ConcatTaskFactory::new(
        "out:",
        [TaskId::new("a"), TaskId::new("b")],
    ));
    let main: Arc<dyn TaskFactory> = Arc::new(ChildStarterTaskFactory::new([
        (TaskId::new("concat"), concat),
        (TaskId::new("b"), constant("B")),
        (TaskId::new("a"), constant("A")),
    ]));

    with_deadline({
        let engine = engine.clone();
        move || engine.run_and_wait("main", main)
    })
    .unwrap();

    let concat = engine.future("concat").unwrap();
    let value = concat.try_result().unwrap().unwrap();
    assert_eq!(value.as_str(), Some("out:AB"));
}

#[test]
fn concurrent_top_level_callers_share_the_build() {
    init_tracing();
    let engine = test_engine(2);
    let recorder = ExecutionRecorder::new();
    let main = recorder.wrap(sequential(vec![
        ("str", recorder.wrap(constant("str"))),
        ("waiter", awaiting("str")),
    ]));

    let values = with_deadline({
        let engine = engine.clone();
        move || {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let engine = engine.clone();
                    let main = Arc::clone(&main);
                    thread::spawn(move || engine.run_and_wait("main", main))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .collect::<Vec<_>>()
        }
    });

    for value in values {
        assert_eq!(value.unwrap().as_str(), Some("strstr"));
    }
    assert_eq!(recorder.count("main"), 1);
    assert_eq!(recorder.count("str"), 1);
    assert_eq!(engine.waiter_counts(), WaiterCounts::default());
}

#[test]
fn external_caller_blocks_until_the_task_finishes() {
    init_tracing();
    let engine = test_engine(1);
    let gate = Gate::new();
    let future = engine
        .start_or_get("slow", GateTaskFactory::new("late value", &gate))
        .unwrap();

    let waiter = {
        let engine = engine.clone();
        let future = future.clone();
        thread::spawn(move || engine.await_result(&future))
    };

    // The caller parks as a waiter while the body is still running.
    assert!(eventually(Duration::from_secs(5), || {
        engine.waiter_counts() == WaiterCounts { running: 1, waiting: 1 }
    }));
    assert!(matches!(future.state(), TaskExecutionState::Running));
    assert!(future.try_result().is_none());

    gate.open();
    let value = waiter.join().unwrap().unwrap();
    assert_eq!(value.as_str(), Some("late value"));

    with_deadline({
        let engine = engine.clone();
        move || engine.wait_idle()
    })
    .unwrap();
    assert_eq!(engine.waiter_counts(), WaiterCounts::default());
}

#[test]
fn entered_driver_can_start_a_dependency_late() {
    init_tracing();
    let engine = test_engine(2);

    let value = with_deadline({
        let engine = engine.clone();
        move || {
            let driver = engine.enter();
            let waiter = driver.start_or_get("waiter", awaiting("x"))?;
            // The waiter is parked on "x" while the driver is still counted.
            thread::sleep(Duration::from_millis(300));
            assert!(!engine.is_deadlocked());
            driver.start_or_get("x", constant("X"))?;
            driver.await_result(&waiter)
        }
    })
    .unwrap();

    assert_eq!(value.as_str(), Some("X"));
    assert!(!engine.is_deadlocked());
    assert_eq!(engine.waiter_counts(), WaiterCounts::default());
}

#[test]
fn awaiting_a_finished_future_returns_its_outcome() {
    init_tracing();
    let engine = test_engine(1);
    let failing: Arc<dyn TaskFactory> = Arc::new(FailingTaskFactory::new("broken input"));
    let future = engine.start_or_get("broken", failing).unwrap();
    with_deadline({
        let engine = engine.clone();
        move || engine.wait_idle()
    })
    .unwrap();
    assert_eq!(engine.report().unobserved_failures, vec![TaskId::new("broken")]);

    let err = engine.await_result(&future).unwrap_err();
    assert!(matches!(err, EngineError::TaskFailed { .. }), "unexpected error: {err:?}");

    let report = engine.report();
    assert!(report.unobserved_failures.is_empty());
    assert_eq!(report.counts, WaiterCounts::default());
    assert!(!report.deadlocked);
}

#[test]
fn wait_idle_returns_once_every_started_task_finished() {
    init_tracing();
    let engine = test_engine(2);
    let gate = Gate::new();
    for name in ["one", "two", "three"] {
        engine
            .start_or_get(name, GateTaskFactory::new(name, &gate))
            .unwrap();
    }
    assert!(gate.wait_entered(2, Duration::from_secs(5)));
    gate.open();

    with_deadline({
        let engine = engine.clone();
        move || engine.wait_idle()
    })
    .unwrap();

    for name in ["one", "two", "three"] {
        let future = engine.future(name).unwrap();
        assert!(future.is_terminal(), "task {name} not finished");
    }
    assert!(engine.future("four").is_none());
    assert_eq!(engine.pool_stats().queued, 0);
}

#[tokio::test]
async fn async_callers_do_not_block_the_runtime() {
    init_tracing();
    let engine = test_engine(2);
    let main = sequential(vec![("str", constant("str")), ("waiter", awaiting("str"))]);

    let value = with_timeout(engine.run_and_wait_async("main", main))
        .await
        .unwrap();

    assert_eq!(value.as_str(), Some("strstr"));
    assert!(!engine.report().deadlocked);
}
