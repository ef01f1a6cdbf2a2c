// tests/property_accounting.rs

use std::sync::Arc;

use dynbuild::engine::WaiterCounts;
use dynbuild::task::{
    AwaitTaskFactory, ChildStarterTaskFactory, ConstantTaskFactory, SequentialStarterTaskFactory,
    TaskFactory,
};
use dynbuild::types::TaskId;
use dynbuild_test_utils::builders::test_engine;
use dynbuild_test_utils::with_deadline;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Node {
    Constant,
    Sequential(Vec<usize>),
    Children(Vec<usize>),
    /// Waits for the given index; `n` means an identifier nobody starts.
    Await(usize),
}

fn name(i: usize) -> TaskId {
    TaskId::new(format!("t{i}"))
}

// Children always have a higher index than their parent, so starting is
// acyclic; awaits may point anywhere and can deadlock.
fn plan_strategy(max_tasks: usize) -> impl Strategy<Value = Vec<Node>> {
    (1..=max_tasks).prop_flat_map(|n| {
        proptest::collection::vec(
            (0u8..4, proptest::collection::vec(any::<usize>(), 0..3), any::<usize>()),
            n,
        )
        .prop_map(move |raw| {
            raw.into_iter()
                .enumerate()
                .map(|(i, (kind, children, target))| {
                    let later = n - i - 1;
                    let mut children: Vec<usize> = if later == 0 {
                        Vec::new()
                    } else {
                        children.into_iter().map(|c| i + 1 + c % later).collect()
                    };
                    children.dedup();
                    match kind {
                        1 if !children.is_empty() => Node::Sequential(children),
                        2 if !children.is_empty() => Node::Children(children),
                        3 => Node::Await(target % (n + 1)),
                        _ => Node::Constant,
                    }
                })
                .collect()
        })
    })
}

fn factories(nodes: &[Node]) -> Vec<Arc<dyn TaskFactory>> {
    let n = nodes.len();
    let mut built: Vec<Option<Arc<dyn TaskFactory>>> = vec![None; n];
    for i in (0..n).rev() {
        let child_specs = |children: &[usize]| -> Vec<(TaskId, Arc<dyn TaskFactory>)> {
            children
                .iter()
                .map(|&c| (name(c), built[c].clone().expect("children are built first")))
                .collect()
        };
        let factory: Arc<dyn TaskFactory> = match &nodes[i] {
            Node::Constant => Arc::new(ConstantTaskFactory::new(format!("v{i}"))),
            Node::Sequential(children) => {
                Arc::new(SequentialStarterTaskFactory::new(child_specs(children)))
            }
            Node::Children(children) => {
                Arc::new(ChildStarterTaskFactory::new(child_specs(children)))
            }
            Node::Await(target) if *target == n => Arc::new(AwaitTaskFactory::new("missing")),
            Node::Await(target) => Arc::new(AwaitTaskFactory::new(name(*target))),
        };
        built[i] = Some(factory);
    }
    built.into_iter().flatten().collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn random_plans_settle_with_balanced_accounting(
        nodes in plan_strategy(7),
        max_workers in 1usize..4,
    ) {
        let root = factories(&nodes).swap_remove(0);
        let engine = test_engine(max_workers);

        let outcome = with_deadline({
            let engine = engine.clone();
            move || engine.run_and_wait(name(0), root)
        });
        let report = engine.report();

        // Every participant left: nobody is stuck and nothing leaked.
        prop_assert_eq!(report.counts, WaiterCounts::default());
        prop_assert_eq!(report.pool.queued, 0);

        for i in 0..nodes.len() {
            prop_assert!(report.executions_of(name(i).as_str()) <= 1, "t{} ran twice", i);
        }

        if report.deadlocked {
            let err = outcome.as_ref().expect_err("a deadlocked build cannot succeed");
            prop_assert!(err.involves_deadlock(), "{:?}", err);
            prop_assert!(engine.deadlock_report().is_some());
        }
        if outcome.is_ok() {
            prop_assert!(!report.deadlocked);
        }

        let has_await = nodes.iter().any(|node| matches!(node, Node::Await(_)));
        if !has_await {
            prop_assert!(outcome.is_ok(), "{:?}", outcome);
        }
    }
}
