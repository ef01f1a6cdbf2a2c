// src/engine/accounting.rs

//! Build-wide running/waiting counters and the deadlock check.
//!
//! Every thread that can make progress on the build is a *participant*:
//! submitted task bodies (queued or executing) and top-level callers blocked
//! in the engine. A participant is either running or waiting, so at every
//! instant `running + waiting == participants`.
//!
//! All transitions happen in one critical section together with the deadlock
//! check, so the check always sees a consistent pair of counters. A deadlock
//! is declared at most once per engine; afterwards the engine is terminal and
//! every further wait fails immediately.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{error, trace};

/// Snapshot of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WaiterCounts {
    pub running: usize,
    pub waiting: usize,
}

impl WaiterCounts {
    pub fn participants(&self) -> usize {
        self.running + self.waiting
    }

    /// Nobody is running but somebody is waiting: nothing can ever wake them.
    pub fn is_stalled(&self) -> bool {
        self.running == 0 && self.waiting > 0
    }
}

/// Result of a transition that can trigger deadlock detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Proceed(WaiterCounts),
    /// This transition stalled the build. The caller is responsible for
    /// waking every blocked participant.
    DeadlockDeclared(WaiterCounts),
}

#[derive(Debug, Default)]
struct AccountingState {
    counts: WaiterCounts,
    deadlocked: bool,
}

#[derive(Debug, Default)]
pub struct WaiterAccounting {
    state: Mutex<AccountingState>,
}

/// Outcome of [`WaiterAccounting::enter_wait`].
#[derive(Debug)]
pub enum EnterWait<'a> {
    Waiting(WaitGuard<'a>),
    /// The thread must not block. `declared` is true if this very call found
    /// the stall; the counters were left as if the wait never happened.
    Deadlocked { declared: bool },
}

impl WaiterAccounting {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counts(&self) -> WaiterCounts {
        self.lock().counts
    }

    pub fn is_deadlocked(&self) -> bool {
        self.lock().deadlocked
    }

    /// A new participant starts running.
    pub fn join(&self) -> WaiterCounts {
        let mut state = self.lock();
        state.counts.running += 1;
        trace!(running = state.counts.running, waiting = state.counts.waiting, "participant joined");
        state.counts
    }

    /// A running participant is done with the build.
    pub fn leave(&self) -> Transition {
        let mut state = self.lock();
        debug_assert!(state.counts.running > 0, "leave without a running participant");
        state.counts.running -= 1;
        trace!(running = state.counts.running, waiting = state.counts.waiting, "participant left");
        Self::check_stall(&mut state)
    }

    /// Move the calling participant from running to waiting.
    ///
    /// The returned guard moves it back exactly once when dropped, unless the
    /// notifier already did so through [`resume_waiters`](Self::resume_waiters)
    /// and the guard was consumed with [`WaitGuard::transferred`].
    pub fn enter_wait(&self) -> EnterWait<'_> {
        let mut state = self.lock();
        if state.deadlocked {
            return EnterWait::Deadlocked { declared: false };
        }
        debug_assert!(state.counts.running > 0, "enter_wait from a non-running participant");
        state.counts.running -= 1;
        state.counts.waiting += 1;
        trace!(running = state.counts.running, waiting = state.counts.waiting, "entered wait");

        match Self::check_stall(&mut state) {
            Transition::Proceed(_) => EnterWait::Waiting(WaitGuard {
                accounting: self,
                armed: true,
            }),
            Transition::DeadlockDeclared(_) => {
                // The declaring thread returns with an error instead of
                // blocking, so it is running again.
                state.counts.waiting -= 1;
                state.counts.running += 1;
                EnterWait::Deadlocked { declared: true }
            }
        }
    }

    /// Move `count` waiters back to running on their behalf.
    ///
    /// Called by a notifier while it still holds the lock of the waitable it
    /// changed, before the notified threads are woken.
    pub fn resume_waiters(&self, count: usize) {
        if count == 0 {
            return;
        }
        let mut state = self.lock();
        debug_assert!(state.counts.waiting >= count, "resumed more waiters than are waiting");
        state.counts.waiting -= count;
        state.counts.running += count;
        trace!(
            running = state.counts.running,
            waiting = state.counts.waiting,
            resumed = count,
            "waiters resumed by notifier"
        );
    }

    fn exit_wait(&self) {
        let mut state = self.lock();
        debug_assert!(state.counts.waiting > 0, "exit_wait without a waiting participant");
        state.counts.waiting -= 1;
        state.counts.running += 1;
        trace!(running = state.counts.running, waiting = state.counts.waiting, "exited wait");
    }

    fn check_stall(state: &mut AccountingState) -> Transition {
        if !state.deadlocked && state.counts.is_stalled() {
            state.deadlocked = true;
            error!(
                running = state.counts.running,
                waiting = state.counts.waiting,
                "deadlock detected: every participant is waiting"
            );
            return Transition::DeadlockDeclared(state.counts);
        }
        Transition::Proceed(state.counts)
    }

    fn lock(&self) -> MutexGuard<'_, AccountingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Registration of one waiting participant.
#[derive(Debug)]
#[must_use = "dropping the guard immediately ends the wait"]
pub struct WaitGuard<'a> {
    accounting: &'a WaiterAccounting,
    armed: bool,
}

impl WaitGuard<'_> {
    /// The notifier already moved this waiter back to running.
    pub fn transferred(mut self) {
        self.armed = false;
    }
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.accounting.exit_wait();
        }
    }
}
