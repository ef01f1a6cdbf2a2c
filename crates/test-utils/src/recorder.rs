//! Instrumented factories for observing task execution from tests.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use dynbuild::engine::TaskContext;
use dynbuild::task::{Task, TaskFactory};
use dynbuild::types::{Fingerprint, TaskId, TaskValue};

/// Counts how often each task body was created (i.e. executed).
#[derive(Debug, Clone, Default)]
pub struct ExecutionRecorder {
    counts: Arc<Mutex<HashMap<TaskId, usize>>>,
}

impl ExecutionRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap `inner` so every body it creates is counted.
    pub fn wrap(&self, inner: Arc<dyn TaskFactory>) -> Arc<dyn TaskFactory> {
        Arc::new(RecordingTaskFactory {
            inner,
            recorder: self.clone(),
        })
    }

    pub fn count(&self, id: &str) -> usize {
        self.counts
            .lock()
            .unwrap()
            .get(id)
            .copied()
            .unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.lock().unwrap().values().sum()
    }

    fn record(&self, id: &TaskId) {
        *self.counts.lock().unwrap().entry(id.clone()).or_insert(0) += 1;
    }
}

#[derive(Debug)]
pub struct RecordingTaskFactory {
    inner: Arc<dyn TaskFactory>,
    recorder: ExecutionRecorder,
}

impl TaskFactory for RecordingTaskFactory {
    fn fingerprint(&self) -> Fingerprint {
        self.inner.fingerprint()
    }

    fn create_task(&self, id: &TaskId) -> Box<dyn Task> {
        self.recorder.record(id);
        self.inner.create_task(id)
    }
}

#[derive(Debug, Default)]
struct GateState {
    open: bool,
    entered: usize,
}

/// A latch task bodies block on (outside the engine) until the test opens it.
#[derive(Debug, Clone, Default)]
pub struct Gate {
    inner: Arc<(Mutex<GateState>, Condvar)>,
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self) {
        let (lock, cv) = &*self.inner;
        lock.lock().unwrap().open = true;
        cv.notify_all();
    }

    /// Wait until `n` bodies have reached the gate.
    pub fn wait_entered(&self, n: usize, timeout: Duration) -> bool {
        let (lock, cv) = &*self.inner;
        let guard = lock.lock().unwrap();
        let (guard, _) = cv
            .wait_timeout_while(guard, timeout, |s| s.entered < n)
            .unwrap();
        guard.entered >= n
    }

    pub fn entered(&self) -> usize {
        self.inner.0.lock().unwrap().entered
    }

    fn pass(&self) {
        let (lock, cv) = &*self.inner;
        let mut state = lock.lock().unwrap();
        state.entered += 1;
        cv.notify_all();
        while !state.open {
            state = cv.wait(state).unwrap();
        }
    }
}

/// Returns `value` once its gate is open.
#[derive(Debug, Clone)]
pub struct GateTaskFactory {
    value: String,
    gate: Gate,
}

impl GateTaskFactory {
    pub fn new(value: &str, gate: &Gate) -> Arc<dyn TaskFactory> {
        Arc::new(Self {
            value: value.to_string(),
            gate: gate.clone(),
        })
    }
}

impl TaskFactory for GateTaskFactory {
    fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(["gate", self.value.as_str()])
    }

    fn create_task(&self, _id: &TaskId) -> Box<dyn Task> {
        Box::new(GateTask {
            value: self.value.clone(),
            gate: self.gate.clone(),
        })
    }
}

struct GateTask {
    value: String,
    gate: Gate,
}

impl Task for GateTask {
    fn run(&mut self, _ctx: &TaskContext<'_>) -> anyhow::Result<TaskValue> {
        self.gate.pass();
        Ok(TaskValue::string(self.value.clone()))
    }
}
