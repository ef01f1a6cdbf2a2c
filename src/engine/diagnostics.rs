// src/engine/diagnostics.rs

//! Wait-for report captured when a deadlock is declared.

use std::fmt;

use petgraph::algo::tarjan_scc;
use petgraph::graphmap::DiGraphMap;

use crate::engine::accounting::WaiterCounts;
use crate::engine::future::{TaskExecutionState, TaskFuture};
use crate::engine::wait::WaiterTag;
use crate::errors::WaitTarget;
use crate::types::TaskId;

/// One blocked participant and what it was blocked on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitEdge {
    pub waiter: WaiterTag,
    pub target: WaitTarget,
}

#[derive(Debug, Clone, Default)]
pub struct DeadlockReport {
    pub counts: WaiterCounts,
    pub edges: Vec<WaitEdge>,
    /// Awaited identifiers nobody ever started.
    pub never_started: Vec<TaskId>,
    /// Groups of tasks waiting on each other in a cycle.
    pub cycles: Vec<Vec<TaskId>>,
}

impl DeadlockReport {
    pub(crate) fn collect(
        counts: WaiterCounts,
        futures: &[TaskFuture],
        quiescence_waiters: Vec<WaiterTag>,
        declarer: Option<WaitEdge>,
    ) -> Self {
        let mut edges: Vec<WaitEdge> = declarer.into_iter().collect();
        let mut never_started = Vec::new();

        for future in futures {
            edges.extend(future.waiter_tags().into_iter().map(|waiter| WaitEdge {
                waiter,
                target: WaitTarget::Task(future.id().clone()),
            }));
        }
        edges.extend(quiescence_waiters.into_iter().map(|waiter| WaitEdge {
            waiter,
            target: WaitTarget::Quiescence,
        }));

        for edge in &edges {
            if let WaitTarget::Task(id) = &edge.target {
                let unstarted = futures
                    .iter()
                    .any(|f| f.id() == id && matches!(f.state(), TaskExecutionState::NotStarted));
                if unstarted && !never_started.contains(id) {
                    never_started.push(id.clone());
                }
            }
        }
        never_started.sort();

        let cycles = find_cycles(&edges);
        Self {
            counts,
            edges,
            never_started,
            cycles,
        }
    }

    /// Every participant blocked on `id`.
    pub fn waiters_of(&self, id: &TaskId) -> Vec<&WaiterTag> {
        self.edges
            .iter()
            .filter(|e| matches!(&e.target, WaitTarget::Task(t) if t == id))
            .map(|e| &e.waiter)
            .collect()
    }
}

fn find_cycles(edges: &[WaitEdge]) -> Vec<Vec<TaskId>> {
    let mut graph: DiGraphMap<&TaskId, ()> = DiGraphMap::new();
    for edge in edges {
        if let (WaiterTag::Task(from), WaitTarget::Task(to)) = (&edge.waiter, &edge.target) {
            graph.add_edge(from, to, ());
        }
    }

    let mut cycles: Vec<Vec<TaskId>> = tarjan_scc(&graph)
        .into_iter()
        .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
        .map(|scc| {
            let mut ids: Vec<TaskId> = scc.into_iter().cloned().collect();
            ids.sort();
            ids
        })
        .collect();
    cycles.sort();
    cycles
}

impl fmt::Display for DeadlockReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "deadlock: {} running, {} waiting",
            self.counts.running, self.counts.waiting
        )?;
        for edge in &self.edges {
            writeln!(f, "  {} waits for {}", edge.waiter, edge.target)?;
        }
        for id in &self.never_started {
            writeln!(f, "  task '{id}' was awaited but never started")?;
        }
        for cycle in &self.cycles {
            let names: Vec<&str> = cycle.iter().map(TaskId::as_str).collect();
            writeln!(f, "  wait cycle: {}", names.join(" -> "))?;
        }
        Ok(())
    }
}
