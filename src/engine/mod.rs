// src/engine/mod.rs

//! The build engine: one instance per build execution.
//!
//! - [`BuildEngine`] is the top-level entry point. External threads use it to
//!   start tasks and block on results; they are counted as participants for
//!   the duration of every blocking call.
//! - Task bodies run on the [`WorkerPool`] and talk to the engine through a
//!   [`TaskContext`].
//! - All blocking waits go through [`wait::WaitCell`] and are accounted in
//!   [`WaiterAccounting`], which declares a deadlock when nobody can make
//!   progress. A deadlock is terminal for the engine.

pub mod accounting;
pub mod context;
pub mod diagnostics;
pub mod future;
pub mod pool;
pub mod registry;
pub mod wait;

use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use anyhow::anyhow;
use tracing::{debug, error, info, warn};

use crate::cache::ResultCache;
use crate::errors::{EngineError, EngineResult, WaitTarget};
use crate::task::TaskFactory;
use crate::types::{Fingerprint, TaskId, TaskValue};

pub use accounting::{Transition, WaiterAccounting, WaiterCounts};
pub use context::TaskContext;
pub use diagnostics::{DeadlockReport, WaitEdge};
pub use future::{TaskExecutionState, TaskFuture};
pub use pool::{PoolOptions, PoolStats, WorkerPool};
pub use registry::TaskGraphRegistry;
pub use wait::{Events, WaiterTag};

use wait::{WaitCell, WaitError};

/// Engine tuning, usually built from the `[engine]` config section.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Upper bound on concurrently active (non-blocked) task bodies.
    pub max_workers: usize,
    /// How long an idle worker thread lingers before exiting.
    pub keep_alive: Duration,
    pub thread_name_prefix: String,
}

impl Default for EngineOptions {
    fn default() -> Self {
        let pool = PoolOptions::default();
        Self {
            max_workers: pool.max_workers,
            keep_alive: pool.keep_alive,
            thread_name_prefix: pool.thread_name_prefix,
        }
    }
}

impl EngineOptions {
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            max_workers: self.max_workers,
            keep_alive: self.keep_alive,
            thread_name_prefix: self.thread_name_prefix.clone(),
        }
    }
}

/// What happened during a build execution so far.
#[derive(Debug, Clone, Default)]
pub struct BuildReport {
    /// Tasks whose body ran, in the order they started.
    pub executed: Vec<TaskId>,
    /// Tasks completed from the result cache without running.
    pub cache_hits: Vec<TaskId>,
    pub failed: Vec<TaskId>,
    /// Failed tasks whose result nobody asked for.
    pub unobserved_failures: Vec<TaskId>,
    pub deadlocked: bool,
    pub counts: WaiterCounts,
    pub pool: PoolStats,
}

impl BuildReport {
    pub fn executions_of(&self, id: &str) -> usize {
        self.executed.iter().filter(|t| t.as_str() == id).count()
    }
}

#[derive(Debug, Default)]
struct Journal {
    executed: Vec<TaskId>,
    cache_hits: Vec<TaskId>,
    failed: Vec<TaskId>,
    observed: HashSet<TaskId>,
}

pub(crate) struct EngineShared {
    pub(crate) accounting: WaiterAccounting,
    pub(crate) registry: TaskGraphRegistry,
    pub(crate) pool: WorkerPool,
    /// Number of submitted task bodies that have not finished yet.
    outstanding: WaitCell<usize>,
    cache: Option<Arc<dyn ResultCache>>,
    journal: Mutex<Journal>,
    deadlock: OnceLock<DeadlockReport>,
}

/// Handle to one build execution. Cheap to clone.
#[derive(Clone)]
pub struct BuildEngine {
    shared: Arc<EngineShared>,
}

impl std::fmt::Debug for BuildEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildEngine")
            .field("tasks", &self.shared.registry.len())
            .field("counts", &self.shared.accounting.counts())
            .field("pool", &self.shared.pool)
            .finish()
    }
}

impl BuildEngine {
    pub fn new(options: EngineOptions) -> Self {
        Self::build(options, None)
    }

    /// Engine that consults `cache` before running any task and stores
    /// successful results into it.
    pub fn with_cache(options: EngineOptions, cache: Arc<dyn ResultCache>) -> Self {
        Self::build(options, Some(cache))
    }

    fn build(options: EngineOptions, cache: Option<Arc<dyn ResultCache>>) -> Self {
        debug!(
            max_workers = options.max_workers,
            cached = cache.is_some(),
            "creating build engine"
        );
        Self {
            shared: Arc::new(EngineShared {
                accounting: WaiterAccounting::new(),
                registry: TaskGraphRegistry::new(),
                pool: WorkerPool::new(options.pool_options()),
                outstanding: WaitCell::new(0),
                cache,
                journal: Mutex::new(Journal::default()),
                deadlock: OnceLock::new(),
            }),
        }
    }

    /// Start `id` unless it is already started, without waiting for it.
    ///
    /// The calling thread is not counted as a participant. A thread that
    /// starts tasks other tasks may already be waiting for must hold a
    /// [`ParticipantGuard`] from [`enter`](Self::enter) across those calls;
    /// otherwise a body parked on a not-yet-started identifier is judged
    /// deadlocked before the target is started.
    pub fn start_or_get(
        &self,
        id: impl Into<TaskId>,
        factory: Arc<dyn TaskFactory>,
    ) -> EngineResult<TaskFuture> {
        self.shared.start_or_get(&id.into(), factory)
    }

    /// Count the calling thread as a running participant until the guard is
    /// dropped.
    pub fn enter(&self) -> ParticipantGuard {
        ParticipantGuard::enter(&self.shared)
    }

    /// Block the calling thread until `future` is terminal.
    ///
    /// A finished future returns at once without touching the accounting.
    /// Threads holding a [`ParticipantGuard`] wait through
    /// [`ParticipantGuard::await_result`] instead.
    pub fn await_result(&self, future: &TaskFuture) -> EngineResult<TaskValue> {
        if let Some(outcome) = self.shared.finished(future) {
            return outcome;
        }
        self.enter().await_result(future)
    }

    /// Block until every started task body has finished.
    pub fn wait_idle(&self) -> EngineResult<()> {
        self.enter().wait_idle()
    }

    /// Start `id`, wait for its result and for every task it caused to be
    /// started, then return the result.
    ///
    /// Returns `Deadlocked` if the engine is deadlocked by the time every
    /// started task has finished, even if the root itself had completed.
    pub fn run_and_wait(
        &self,
        id: impl Into<TaskId>,
        factory: Arc<dyn TaskFactory>,
    ) -> EngineResult<TaskValue> {
        let id = id.into();
        info!(task = %id, "build started");

        let participant = self.enter();
        let root = participant
            .start_or_get(id.clone(), factory)
            .and_then(|future| participant.await_result(&future));
        let idle = participant.wait_idle();
        drop(participant);

        let result = if self.shared.accounting.is_deadlocked() {
            self.shared
                .outstanding
                .wait_unaccounted(|outstanding| *outstanding == 0);
            Err(pick_deadlock_error(root, idle))
        } else {
            idle.and(root)
        };

        let report = self.report();
        for unobserved in &report.unobserved_failures {
            warn!(task = %unobserved, "task failed but nobody waited for its result");
        }
        match &result {
            Ok(_) => info!(
                task = %id,
                executed = report.executed.len(),
                cache_hits = report.cache_hits.len(),
                "build finished"
            ),
            Err(err) => error!(task = %id, error = %err, "build failed"),
        }
        result
    }

    /// [`run_and_wait`](Self::run_and_wait) for async callers.
    ///
    /// The blocking wait runs on tokio's blocking pool, so no runtime worker
    /// is parked.
    pub async fn run_and_wait_async(
        &self,
        id: impl Into<TaskId>,
        factory: Arc<dyn TaskFactory>,
    ) -> EngineResult<TaskValue> {
        let id = id.into();
        let engine = self.clone();
        let task = id.clone();
        tokio::task::spawn_blocking(move || engine.run_and_wait(task, factory))
            .await
            .unwrap_or_else(|join_err| {
                Err(EngineError::task_failed(
                    id,
                    anyhow!("top-level wait did not complete: {join_err}"),
                ))
            })
    }

    pub fn future(&self, id: impl Into<TaskId>) -> Option<TaskFuture> {
        self.shared.registry.get(&id.into())
    }

    pub fn waiter_counts(&self) -> WaiterCounts {
        self.shared.accounting.counts()
    }

    pub fn is_deadlocked(&self) -> bool {
        self.shared.accounting.is_deadlocked()
    }

    pub fn deadlock_report(&self) -> Option<DeadlockReport> {
        self.shared.deadlock.get().cloned()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.shared.pool.stats()
    }

    pub fn report(&self) -> BuildReport {
        let journal = self.shared.journal();
        let unobserved_failures = journal
            .failed
            .iter()
            .filter(|id| !journal.observed.contains(*id))
            .cloned()
            .collect();
        BuildReport {
            executed: journal.executed.clone(),
            cache_hits: journal.cache_hits.clone(),
            failed: journal.failed.clone(),
            unobserved_failures,
            deadlocked: self.shared.accounting.is_deadlocked(),
            counts: self.shared.accounting.counts(),
            pool: self.shared.pool.stats(),
        }
    }
}

/// Prefer the error that names what the caller was actually blocked on.
fn pick_deadlock_error(root: EngineResult<TaskValue>, idle: EngineResult<()>) -> EngineError {
    match (root, idle) {
        (Err(err), _) if err.involves_deadlock() => err,
        (_, Err(err)) if err.is_deadlock() => err,
        _ => EngineError::Deadlocked {
            waiting_on: WaitTarget::Quiescence,
        },
    }
}

impl EngineShared {
    pub(crate) fn start_or_get(
        self: &Arc<Self>,
        id: &TaskId,
        factory: Arc<dyn TaskFactory>,
    ) -> EngineResult<TaskFuture> {
        self.registry
            .start_or_get(id, &factory, &self.accounting, |future| {
                self.launch(future, &factory)
            })
    }

    /// Run a freshly claimed task: complete it from the cache or hand its
    /// body to the pool.
    fn launch(self: &Arc<Self>, future: &TaskFuture, factory: &Arc<dyn TaskFactory>) {
        let id = future.id().clone();
        let fingerprint = factory.fingerprint();

        if let Some(cache) = &self.cache {
            if let Some(value) = cache.lookup(&id, &fingerprint) {
                debug!(task = %id, "result cache hit; task body skipped");
                self.journal().cache_hits.push(id);
                future.complete(Ok(value), &self.accounting);
                return;
            }
        }

        // The body is a participant from submission on, even while queued.
        self.accounting.join();
        self.outstanding.update(&self.accounting, |outstanding| {
            *outstanding += 1;
            ((), Events::NONE)
        });

        let shared = Arc::clone(self);
        let job_future = future.clone();
        let job_factory = Arc::clone(factory);
        let submitted = self.pool.submit(Box::new(move || {
            shared.execute(&job_future, job_factory.as_ref(), fingerprint)
        }));
        if let Err(err) = submitted {
            error!(task = %id, error = %err, "could not schedule task body");
            self.finish(future, Err(err));
        }
    }

    /// Worker side of a task: run the body and publish its outcome.
    fn execute(
        self: &Arc<Self>,
        future: &TaskFuture,
        factory: &dyn TaskFactory,
        fingerprint: Fingerprint,
    ) {
        let id = future.id().clone();
        debug!(task = %id, "task body started");
        self.journal().executed.push(id.clone());

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut task = factory.create_task(&id);
            let ctx = TaskContext::new(self, future);
            task.run(&ctx)
        }));

        let outcome = match outcome {
            Ok(Ok(value)) => {
                if let Some(cache) = &self.cache {
                    cache.store(&id, &fingerprint, &value);
                }
                Ok(value)
            }
            Ok(Err(err)) => Err(classify_failure(&id, err)),
            Err(payload) => Err(EngineError::task_failed(
                id.clone(),
                anyhow!("task panicked: {}", panic_message(payload.as_ref())),
            )),
        };
        self.finish(future, outcome);
    }

    /// Publish the outcome, then leave. Waiters are moved back to running
    /// before this participant stops counting as running.
    fn finish(&self, future: &TaskFuture, outcome: EngineResult<TaskValue>) {
        let id = future.id();
        match &outcome {
            Ok(_) => debug!(task = %id, "task completed"),
            Err(err) => {
                if err.is_deadlock() {
                    warn!(task = %id, error = %err, "task aborted by deadlock");
                } else {
                    debug!(task = %id, error = %err, "task failed");
                }
                self.journal().failed.push(id.clone());
            }
        }

        future.complete(outcome, &self.accounting);
        self.outstanding.update(&self.accounting, |outstanding| {
            *outstanding -= 1;
            let events = if *outstanding == 0 {
                Events::FINISHED
            } else {
                Events::NONE
            };
            ((), events)
        });

        if let Transition::DeadlockDeclared(_) = self.accounting.leave() {
            self.on_deadlock(None);
        }
    }

    /// The memoized outcome of a terminal future, marked as observed.
    fn finished(&self, future: &TaskFuture) -> Option<EngineResult<TaskValue>> {
        let outcome = future.try_result()?;
        self.observe(future.id());
        Some(outcome)
    }

    pub(crate) fn await_future(
        &self,
        future: &TaskFuture,
        tag: &WaiterTag,
    ) -> EngineResult<TaskValue> {
        self.observe(future.id());
        let target = WaitTarget::Task(future.id().clone());
        match future.wait_result(&self.accounting, tag) {
            Ok(outcome) => outcome,
            Err(err) => Err(self.wait_failed(err, tag, target)),
        }
    }

    pub(crate) fn await_state(
        &self,
        future: &TaskFuture,
        tag: &WaiterTag,
        events: Events,
        predicate: impl FnMut(&TaskExecutionState) -> anyhow::Result<bool>,
    ) -> EngineResult<TaskExecutionState> {
        let target = WaitTarget::Task(future.id().clone());
        future
            .wait_for_state(&self.accounting, tag, events, predicate)
            .map_err(|err| self.wait_failed(err, tag, target))
    }

    fn wait_quiescent(&self, tag: &WaiterTag) -> EngineResult<()> {
        self.outstanding
            .wait_until(&self.accounting, tag, Events::FINISHED, |outstanding| {
                Ok((*outstanding == 0).then_some(()))
            })
            .map_err(|err| self.wait_failed(err, tag, WaitTarget::Quiescence))
    }

    fn wait_failed(&self, err: WaitError, tag: &WaiterTag, target: WaitTarget) -> EngineError {
        match err {
            WaitError::Deadlocked { declared } => {
                if declared {
                    self.on_deadlock(Some(WaitEdge {
                        waiter: tag.clone(),
                        target: target.clone(),
                    }));
                }
                EngineError::Deadlocked { waiting_on: target }
            }
            WaitError::Condition(cause) => EngineError::WaitCondition {
                target,
                cause: Arc::new(cause),
            },
        }
    }

    /// Called by whichever participant declared the deadlock, after it
    /// released every lock it held.
    fn on_deadlock(&self, declarer: Option<WaitEdge>) {
        let futures = self.registry.snapshot();
        let report = DeadlockReport::collect(
            self.accounting.counts(),
            &futures,
            self.outstanding.waiter_tags(),
            declarer,
        );
        error!("{report}");
        let _ = self.deadlock.set(report);

        for future in &futures {
            future.wake_all();
        }
        self.outstanding.wake_all();
    }

    pub(crate) fn observe(&self, id: &TaskId) {
        self.journal().observed.insert(id.clone());
    }

    fn journal(&self) -> MutexGuard<'_, Journal> {
        self.journal.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for EngineShared {
    fn drop(&mut self) {
        self.pool.shutdown();
    }
}

/// A thread outside the worker pool counted as a running participant.
///
/// An external driver that interleaves [`start_or_get`](Self::start_or_get)
/// calls with waits holds one for the whole sequence, so tasks parked on
/// identifiers it has yet to start are not mistaken for a deadlock. Waits
/// made through the guard reuse its participation.
pub struct ParticipantGuard {
    shared: Arc<EngineShared>,
}

impl ParticipantGuard {
    fn enter(shared: &Arc<EngineShared>) -> Self {
        shared.accounting.join();
        Self {
            shared: Arc::clone(shared),
        }
    }

    pub fn start_or_get(
        &self,
        id: impl Into<TaskId>,
        factory: Arc<dyn TaskFactory>,
    ) -> EngineResult<TaskFuture> {
        self.shared.start_or_get(&id.into(), factory)
    }

    pub fn await_result(&self, future: &TaskFuture) -> EngineResult<TaskValue> {
        if let Some(outcome) = self.shared.finished(future) {
            return outcome;
        }
        self.shared.await_future(future, &WaiterTag::TopLevel)
    }

    /// Block until every started task body has finished.
    pub fn wait_idle(&self) -> EngineResult<()> {
        self.shared.wait_quiescent(&WaiterTag::TopLevel)
    }
}

impl std::fmt::Debug for ParticipantGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParticipantGuard")
            .field("counts", &self.shared.accounting.counts())
            .finish()
    }
}

impl Drop for ParticipantGuard {
    fn drop(&mut self) {
        if let Transition::DeadlockDeclared(_) = self.shared.accounting.leave() {
            self.shared.on_deadlock(None);
        }
    }
}

/// A body that propagated a deadlock marks its own task deadlocked rather
/// than failed.
fn classify_failure(id: &TaskId, err: anyhow::Error) -> EngineError {
    match err.downcast_ref::<EngineError>() {
        Some(EngineError::Deadlocked { waiting_on }) => EngineError::Deadlocked {
            waiting_on: waiting_on.clone(),
        },
        _ => EngineError::task_failed(id.clone(), err),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
