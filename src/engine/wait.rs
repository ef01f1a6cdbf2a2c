// src/engine/wait.rs

//! Blocking wait protocol shared by task futures and the quiescence counter.
//!
//! A [`WaitCell`] couples a piece of state with a condition variable and the
//! list of threads currently registered as waiting on it. The protocol:
//!
//! 1. The waiter locks the cell and evaluates its condition.
//! 2. If the condition does not hold, it registers itself and calls
//!    [`WaiterAccounting::enter_wait`] *before* releasing the lock.
//! 3. A notifier changes the state under the same lock, removes every waiter
//!    interested in that change, moves them back to running with
//!    [`WaiterAccounting::resume_waiters`], and only then wakes them.
//! 4. A woken waiter that is still registered (spurious wake-up or deadlock
//!    broadcast) keeps its own registration and releases it itself.
//!
//! Because registration and notification both happen under the cell lock,
//! a wake-up is never lost, and because the notifier transfers waiters while
//! it is itself running, the running count never drops to zero spuriously.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::engine::accounting::{EnterWait, WaitGuard, WaiterAccounting};
use crate::types::TaskId;

/// Set of state changes a waiter can be woken for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Events(u8);

impl Events {
    pub const NONE: Events = Events(0);
    /// The task left `NotStarted`.
    pub const STARTED: Events = Events(1);
    /// The task reached a terminal state (or the quiescence counter hit zero).
    pub const FINISHED: Events = Events(1 << 1);
    pub const ALL: Events = Events(Self::STARTED.0 | Self::FINISHED.0);

    pub fn union(self, other: Events) -> Events {
        Events(self.0 | other.0)
    }

    pub fn intersects(self, other: Events) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Who is blocked on a cell. Used for deadlock diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WaiterTag {
    Task(TaskId),
    TopLevel,
}

impl std::fmt::Display for WaiterTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WaiterTag::Task(id) => write!(f, "task '{id}'"),
            WaiterTag::TopLevel => f.write_str("top-level caller"),
        }
    }
}

/// Why [`WaitCell::wait_until`] returned without a value.
#[derive(Debug)]
pub enum WaitError {
    Deadlocked { declared: bool },
    Condition(anyhow::Error),
}

#[derive(Debug)]
struct Waiter {
    ticket: u64,
    tag: WaiterTag,
    interest: Events,
}

#[derive(Debug)]
struct CellState<S> {
    value: S,
    waiters: Vec<Waiter>,
    next_ticket: u64,
}

impl<S> CellState<S> {
    fn register(&mut self, tag: &WaiterTag, interest: Events) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.waiters.push(Waiter {
            ticket,
            tag: tag.clone(),
            interest,
        });
        ticket
    }

    fn is_registered(&self, ticket: u64) -> bool {
        self.waiters.iter().any(|w| w.ticket == ticket)
    }

    fn deregister(&mut self, ticket: u64) -> bool {
        let before = self.waiters.len();
        self.waiters.retain(|w| w.ticket != ticket);
        self.waiters.len() != before
    }
}

#[derive(Debug)]
pub struct WaitCell<S> {
    state: Mutex<CellState<S>>,
    changed: Condvar,
}

impl<S> WaitCell<S> {
    pub fn new(value: S) -> Self {
        Self {
            state: Mutex::new(CellState {
                value,
                waiters: Vec::new(),
                next_ticket: 0,
            }),
            changed: Condvar::new(),
        }
    }

    pub fn read<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        f(&self.lock().value)
    }

    /// Mutate the state and wake the waiters interested in the reported events.
    ///
    /// `f` returns its result together with the events the change produced.
    pub fn update<R>(
        &self,
        accounting: &WaiterAccounting,
        f: impl FnOnce(&mut S) -> (R, Events),
    ) -> R {
        let mut state = self.lock();
        let (result, events) = f(&mut state.value);
        if events.is_empty() {
            return result;
        }

        let before = state.waiters.len();
        state.waiters.retain(|w| !w.interest.intersects(events));
        accounting.resume_waiters(before - state.waiters.len());
        self.changed.notify_all();
        result
    }

    /// Wake every blocked thread without changing the state.
    ///
    /// Used after a deadlock was declared; the woken threads observe the
    /// deadlock flag and leave with an error.
    pub fn wake_all(&self) {
        let _state = self.lock();
        self.changed.notify_all();
    }

    pub fn waiter_tags(&self) -> Vec<WaiterTag> {
        self.lock().waiters.iter().map(|w| w.tag.clone()).collect()
    }

    /// Block the calling participant until `check` yields a value.
    ///
    /// `check` runs under the cell lock, first immediately and then after
    /// each change matching `interest`. It may fail; the accounting is
    /// released on every exit path, including unwinding out of `check`.
    pub fn wait_until<R>(
        &self,
        accounting: &WaiterAccounting,
        tag: &WaiterTag,
        interest: Events,
        mut check: impl FnMut(&S) -> anyhow::Result<Option<R>>,
    ) -> Result<R, WaitError> {
        let mut parked = Parked {
            cell: self,
            state: Some(self.lock()),
            registration: None,
        };

        loop {
            match check(&parked.state().value) {
                Ok(Some(value)) => return Ok(value),
                Ok(None) => {}
                Err(err) => return Err(WaitError::Condition(err)),
            }

            if parked.registration.is_none() {
                match accounting.enter_wait() {
                    EnterWait::Waiting(guard) => {
                        let ticket = parked.state().register(tag, interest);
                        parked.registration = Some(Registration { ticket, guard });
                    }
                    EnterWait::Deadlocked { declared } => {
                        return Err(WaitError::Deadlocked { declared });
                    }
                }
            } else if accounting.is_deadlocked() {
                return Err(WaitError::Deadlocked { declared: false });
            }

            parked.block();
        }
    }

    /// Block without registering as a waiter.
    ///
    /// Only valid once the build has been declared deadlocked: the accounting
    /// is terminal then, and every remaining participant fails its waits
    /// immediately, so `done` eventually holds.
    pub fn wait_unaccounted(&self, mut done: impl FnMut(&S) -> bool) {
        let mut state = self.lock();
        while !done(&state.value) {
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn lock(&self) -> MutexGuard<'_, CellState<S>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Registration<'a> {
    ticket: u64,
    guard: WaitGuard<'a>,
}

/// A waiter holding the cell lock, possibly registered.
///
/// Dropping it settles the registration while the lock is still held, so a
/// concurrent notifier and the waiter itself never both release it.
struct Parked<'c, 'a, S> {
    cell: &'c WaitCell<S>,
    state: Option<MutexGuard<'c, CellState<S>>>,
    registration: Option<Registration<'a>>,
}

impl<S> Parked<'_, '_, S> {
    fn state(&mut self) -> &mut CellState<S> {
        match self.state.as_deref_mut() {
            Some(state) => state,
            None => unreachable!("cell lock is held outside of block()"),
        }
    }

    fn block(&mut self) {
        if let Some(guard) = self.state.take() {
            let guard = self
                .cell
                .changed
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
            self.state = Some(guard);
        }

        let Some(ticket) = self.registration.as_ref().map(|reg| reg.ticket) else {
            return;
        };
        if !self.state().is_registered(ticket) {
            if let Some(reg) = self.registration.take() {
                reg.guard.transferred();
            }
        }
    }
}

impl<S> Drop for Parked<'_, '_, S> {
    fn drop(&mut self) {
        let Some(reg) = self.registration.take() else {
            return;
        };
        let still_registered = match self.state.as_deref_mut() {
            Some(state) => state.deregister(reg.ticket),
            None => true,
        };
        if still_registered {
            drop(reg.guard);
        } else {
            reg.guard.transferred();
        }
    }
}
