// tests/worker_pool.rs

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use dynbuild::engine::{PoolOptions, WorkerPool};
use dynbuild::task::{
    ChildStarterTaskFactory, FnTaskFactory, SequentialStarterTaskFactory, TaskFactory,
};
use dynbuild::types::{TaskId, TaskValue};
use dynbuild_test_utils::builders::{constant, test_engine};
use dynbuild_test_utils::{init_tracing, with_deadline};

fn chain(depth: usize) -> Arc<dyn TaskFactory> {
    (0..depth).fold(constant("leaf"), |inner, level| {
        Arc::new(SequentialStarterTaskFactory::new([(
            TaskId::new(format!("level{level}")),
            inner,
        )]))
    })
}

#[test]
fn blocked_workers_free_their_slot() {
    init_tracing();
    let engine = test_engine(1);

    let value = with_deadline({
        let engine = engine.clone();
        move || engine.run_and_wait("main", chain(10))
    })
    .unwrap();

    assert_eq!(value.as_str(), Some("leaf"));
    // Every level blocks on the next one while holding its own thread.
    assert!(engine.pool_stats().peak_threads >= 10);
}

#[test]
fn active_bodies_stay_within_the_worker_bound() {
    init_tracing();
    let engine = test_engine(2);
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let children: Vec<(TaskId, Arc<dyn TaskFactory>)> = (0..8)
        .map(|i| {
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            let body = FnTaskFactory::shared(format!("busy{i}"), move |_ctx| {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(20));
                current.fetch_sub(1, Ordering::SeqCst);
                Ok(TaskValue::unit())
            });
            (TaskId::new(format!("busy{i}")), body)
        })
        .collect();
    let main: Arc<dyn TaskFactory> = Arc::new(ChildStarterTaskFactory::new(children));

    with_deadline({
        let engine = engine.clone();
        move || engine.run_and_wait("main", main)
    })
    .unwrap();

    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(engine.report().executed.len(), 9);
    assert!(engine.pool_stats().peak_threads <= 2);
}

#[test]
fn pool_never_grows_past_the_bound_without_blocking() {
    init_tracing();
    let pool = WorkerPool::new(PoolOptions {
        max_workers: 2,
        ..PoolOptions::default()
    });
    let (tx, rx) = mpsc::channel();

    for i in 0..20 {
        let tx = tx.clone();
        pool.submit(Box::new(move || {
            thread::sleep(Duration::from_millis(1));
            tx.send(i).unwrap();
        }))
        .unwrap();
    }
    drop(tx);

    let mut done: Vec<i32> = rx.iter().collect();
    done.sort();
    assert_eq!(done, (0..20).collect::<Vec<_>>());

    let stats = pool.stats();
    assert!(stats.peak_threads <= 2, "{stats:?}");
    assert!(stats.spawned_total >= 1);
    assert_eq!(stats.queued, 0);
    pool.shutdown();
}

#[test]
fn zero_workers_is_raised_to_one() {
    let pool = WorkerPool::new(PoolOptions {
        max_workers: 0,
        ..PoolOptions::default()
    });
    assert_eq!(pool.options().max_workers, 1);
}
