// src/engine/pool.rs

//! Growable pool of worker threads running task bodies.
//!
//! - At most `max_workers` jobs are *active* at once. A worker that blocks on
//!   a dependency reports it with [`WorkerPool::worker_blocked`], giving its
//!   slot to queued work; the blocked thread itself is the waiter, the pool
//!   never spawns a thread just to wait.
//! - Threads are spawned on demand when work is queued, a slot is free and no
//!   idle thread is available. Idle threads exit after `keep_alive`.
//! - When every slot is taken, submitted jobs stay queued.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::errors::{EngineError, EngineResult};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub max_workers: usize,
    pub keep_alive: Duration,
    pub thread_name_prefix: String,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_workers: thread::available_parallelism().map_or(4, |n| n.get()),
            keep_alive: Duration::from_secs(5),
            thread_name_prefix: "dynbuild-worker".to_string(),
        }
    }
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub threads: usize,
    pub active: usize,
    pub idle: usize,
    pub queued: usize,
    pub spawned_total: usize,
    pub peak_threads: usize,
}

#[derive(Default)]
struct PoolState {
    queue: VecDeque<Job>,
    active: usize,
    idle: usize,
    /// Spawned threads that have not reached the worker loop yet.
    starting: usize,
    threads: usize,
    spawned_total: usize,
    peak_threads: usize,
    shutdown: bool,
}

struct PoolInner {
    options: PoolOptions,
    state: Mutex<PoolState>,
    work_ready: Condvar,
}

#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("options", &self.inner.options)
            .field("stats", &self.stats())
            .finish()
    }
}

impl WorkerPool {
    pub fn new(mut options: PoolOptions) -> Self {
        options.max_workers = options.max_workers.max(1);
        Self {
            inner: Arc::new(PoolInner {
                options,
                state: Mutex::new(PoolState::default()),
                work_ready: Condvar::new(),
            }),
        }
    }

    pub fn options(&self) -> &PoolOptions {
        &self.inner.options
    }

    /// Queue a job, waking or spawning a worker if a slot is free.
    ///
    /// Fails only if no worker thread exists and none could be spawned; the
    /// job is then dropped without running.
    pub fn submit(&self, job: Job) -> EngineResult<()> {
        let mut state = self.inner.lock();
        if state.shutdown {
            warn!("job submitted to a pool that is shutting down");
        }
        state.queue.push_back(job);
        if let Err(err) = self.inner.schedule(&mut state) {
            if state.threads == 0 {
                state.queue.pop_back();
                return Err(EngineError::WorkerSpawn(Arc::new(err)));
            }
            warn!(error = %err, "could not grow worker pool; job stays queued");
        }
        Ok(())
    }

    /// The calling worker is about to block on a dependency.
    pub fn worker_blocked(&self) {
        let mut state = self.inner.lock();
        debug_assert!(state.active > 0, "worker_blocked outside of a job");
        state.active -= 1;
        if let Err(err) = self.inner.schedule(&mut state) {
            warn!(error = %err, "could not grow worker pool while a worker blocks");
        }
    }

    /// The calling worker resumed after a dependency wait.
    ///
    /// Resumed workers continue immediately, so `active` may briefly exceed
    /// `max_workers`; no new job starts until it drops again.
    pub fn worker_resumed(&self) {
        self.inner.lock().active += 1;
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.lock();
        PoolStats {
            threads: state.threads,
            active: state.active,
            idle: state.idle,
            queued: state.queue.len(),
            spawned_total: state.spawned_total,
            peak_threads: state.peak_threads,
        }
    }

    /// Let idle workers exit once the queue is drained.
    pub fn shutdown(&self) {
        let mut state = self.inner.lock();
        state.shutdown = true;
        self.inner.work_ready.notify_all();
    }
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make sure every runnable queued job has a thread to take it.
    fn schedule(self: &Arc<Self>, state: &mut PoolState) -> std::io::Result<()> {
        let free_slots = self.options.max_workers.saturating_sub(state.active);
        let wanted = state.queue.len().min(free_slots);
        if wanted == 0 {
            return Ok(());
        }
        if state.idle > 0 {
            self.work_ready.notify_all();
        }
        let takers = state.idle + state.starting;
        for _ in takers..wanted {
            self.spawn_worker(state)?;
        }
        Ok(())
    }

    fn spawn_worker(self: &Arc<Self>, state: &mut PoolState) -> std::io::Result<()> {
        let name = format!(
            "{}-{}",
            self.options.thread_name_prefix, state.spawned_total
        );
        let inner = Arc::clone(self);
        thread::Builder::new()
            .name(name.clone())
            .spawn(move || inner.worker_loop())?;

        state.threads += 1;
        state.starting += 1;
        state.spawned_total += 1;
        state.peak_threads = state.peak_threads.max(state.threads);
        debug!(thread = %name, threads = state.threads, "spawned worker thread");
        Ok(())
    }

    fn worker_loop(self: Arc<Self>) {
        let max = self.options.max_workers;
        let mut state = self.lock();
        state.starting -= 1;
        loop {
            if state.active < max {
                if let Some(job) = state.queue.pop_front() {
                    state.active += 1;
                    if let Err(err) = self.schedule(&mut state) {
                        warn!(error = %err, "could not grow worker pool");
                    }
                    drop(state);

                    job();

                    state = self.lock();
                    state.active -= 1;
                    continue;
                }
            }

            if state.shutdown {
                break;
            }

            state.idle += 1;
            let (guard, timeout) = self
                .work_ready
                .wait_timeout(state, self.options.keep_alive)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
            state.idle -= 1;

            let has_work = !state.queue.is_empty() && state.active < max;
            if timeout.timed_out() && !has_work {
                break;
            }
        }

        state.threads -= 1;
        debug!(threads = state.threads, "worker thread exiting");
    }
}
