//! Deferred result of a computation run by another thread.
//!
//! The result moves through a lock-free state machine. `run` and `cancel`
//! only ever CAS the state and the runner slot, so neither blocks the other.
//!
//! # States
//!
//! ```text
//!   Pending ──► Completing ──► Completed
//!      │             └───────► Failed
//!      ├──────────────────────► Cancelled
//!      └──► CancelInProgress ──► CancelledInterrupted
//! ```
//!
//! Transitions only move forward. The outcome is written once, between the
//! `Pending -> Completing` CAS and the release store of the terminal state.
//!
//! # Runner Slot
//!
//! A thread must claim the runner slot (CAS from empty to its own
//! `ThreadSignal`) before touching the computation. The claim gives exclusive
//! access to the computation cell and names the thread `cancel(true)`
//! interrupts. Finishing threads reuse the same claim to drop the
//! computation once the result settles.
//!
//! # Waiters
//!
//! `get` pushes a `WaitSlot` onto a lock-free `WaitStack` and parks. The
//! thread that settles the result detaches the stack and wakes every waiter.
//! A waiter that times out or is interrupted abandons its slot and purges
//! the stack.

use std::cell::UnsafeCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::epoch::{self, Atomic, Owned, Shared};
use tracing::{debug, trace};

use crate::error::{BoxError, CoordinationError, Result};
use crate::parking::thread_signal::{self, ThreadSignal, park};
use crate::parking::wait_slot::WaitSlot;
use crate::parking::wait_stack::WaitStack;

/// Yields a waiter performs while the result is settling before it parks.
///
pub const COMPLETING_SPIN_LIMIT: usize = 64;

type Computation<T> = Box<dyn FnMut() -> std::result::Result<T, BoxError> + Send>;

type DoneHook = Box<dyn FnOnce() + Send>;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeferredState {
    Pending = 0,
    Completing = 1,
    Completed = 2,
    Failed = 3,
    Cancelled = 4,
    CancelInProgress = 5,
    CancelledInterrupted = 6,
}

impl DeferredState {
    // Only discriminants of this enum are ever stored.
    //
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => DeferredState::Pending,
            1 => DeferredState::Completing,
            2 => DeferredState::Completed,
            3 => DeferredState::Failed,
            4 => DeferredState::Cancelled,
            5 => DeferredState::CancelInProgress,
            _ => DeferredState::CancelledInterrupted,
        }
    }

    /// A state that is about to become terminal without blocking.
    ///
    #[inline]
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            DeferredState::Completing | DeferredState::CancelInProgress
        )
    }

    /// A terminal state.
    ///
    #[inline]
    pub fn is_settled(self) -> bool {
        !self.is_transient() && self != DeferredState::Pending
    }
}

/// Coarse view of a deferred result.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultState {
    Running,
    Success,
    Failed,
    Cancelled,
}

struct AtomicState(AtomicU8);

impl AtomicState {
    fn new(state: DeferredState) -> Self {
        AtomicState(AtomicU8::new(state as u8))
    }

    #[inline]
    fn load(&self) -> DeferredState {
        DeferredState::from_raw(self.0.load(Ordering::Acquire))
    }

    #[inline]
    fn store(&self, state: DeferredState) {
        self.0.store(state as u8, Ordering::Release);
    }

    #[inline]
    fn transition(&self, from: DeferredState, to: DeferredState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

// Held while a thread owns the runner slot. Empties the slot on drop.
//
struct RunnerClaim<'a> {
    runner: &'a Atomic<ThreadSignal>,
}

impl Drop for RunnerClaim<'_> {
    fn drop(&mut self) {
        let guard = &epoch::pin();

        let previous = self.runner.swap(Shared::null(), Ordering::AcqRel, guard);

        if !previous.is_null() {
            // SAFETY: the slot held the only link to this handle.
            //
            unsafe { guard.defer_destroy(previous) };
        }
    }
}

pub struct DeferredResult<T> {
    state: AtomicState,
    runner: Atomic<ThreadSignal>,
    waiters: WaitStack,
    // Accessed only by the holder of the runner slot.
    //
    computation: UnsafeCell<Option<Computation<T>>>,
    // Written once before the terminal state is published.
    //
    outcome: UnsafeCell<Option<Result<T>>>,
    // Taken once by the thread that settles the result.
    //
    done_hook: UnsafeCell<Option<DoneHook>>,
}

unsafe impl<T: Send> Send for DeferredResult<T> {}
unsafe impl<T: Send + Sync> Sync for DeferredResult<T> {}

impl<T> DeferredResult<T> {
    /// Wraps a fallible computation.
    ///
    pub fn new<F, E>(mut computation: F) -> Self
    where
        F: FnMut() -> std::result::Result<T, E> + Send + 'static,
        E: Into<BoxError>,
    {
        DeferredResult {
            state: AtomicState::new(DeferredState::Pending),
            runner: Atomic::null(),
            waiters: WaitStack::new(),
            computation: UnsafeCell::new(Some(Box::new(move || {
                computation().map_err(Into::into)
            }))),
            outcome: UnsafeCell::new(None),
            done_hook: UnsafeCell::new(None),
        }
    }

    /// Wraps a side-effecting runnable that yields `value` on success.
    ///
    pub fn from_runnable<F>(mut runnable: F, value: T) -> Self
    where
        F: FnMut() + Send + 'static,
        T: Clone + Send + 'static,
    {
        Self::new(move || {
            runnable();
            Ok::<T, BoxError>(value.clone())
        })
    }

    /// Registers a hook invoked exactly once, after the result settles and
    /// waiters are released.
    ///
    pub fn with_done_hook<F>(mut self, hook: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        *self.done_hook.get_mut() = Some(Box::new(hook));
        self
    }

    /// Runs the computation unless it already ran, is running, or was
    /// cancelled. A concurrent second call is a no-op.
    ///
    pub fn run(&self) {
        if self.state.load() != DeferredState::Pending {
            return;
        }

        let Some(claim) = self.claim_runner() else {
            return;
        };

        // SAFETY: the runner claim gives exclusive access to the computation.
        //
        let computation = unsafe { (*self.computation.get()).take() };

        if let Some(mut computation) = computation
            && self.state.load() == DeferredState::Pending
        {
            match panic::catch_unwind(AssertUnwindSafe(|| computation())) {
                Ok(Ok(value)) => self.set(value),
                Ok(Err(error)) => self.set_failure(CoordinationError::computation_failed(error)),
                Err(payload) => self.set_failure(CoordinationError::panicked(payload)),
            }
        }

        drop(claim);

        self.wait_for_cancel_interrupt();
    }

    /// Runs the computation without settling the result on success, so it
    /// can run again. Returns true if the computation completed and the
    /// result is still pending.
    ///
    pub fn run_and_reset(&self) -> bool {
        if self.state.load() != DeferredState::Pending {
            return false;
        }

        let Some(claim) = self.claim_runner() else {
            return false;
        };

        let mut ran = false;

        // SAFETY: the runner claim gives exclusive access to the computation.
        //
        let computation = unsafe { (*self.computation.get()).take() };

        if let Some(mut computation) = computation {
            if self.state.load() == DeferredState::Pending {
                match panic::catch_unwind(AssertUnwindSafe(|| computation())) {
                    Ok(Ok(_)) => ran = true,
                    Ok(Err(error)) => {
                        self.set_failure(CoordinationError::computation_failed(error))
                    }
                    Err(payload) => self.set_failure(CoordinationError::panicked(payload)),
                }
            }

            if self.state.load() == DeferredState::Pending {
                // SAFETY: still holding the runner claim.
                //
                unsafe { *self.computation.get() = Some(computation) };
            }
        }

        drop(claim);

        let state = self.state.load();

        if state != DeferredState::Pending {
            // A cancel that raced the put-back could not claim the slot.
            //
            self.wait_for_cancel_interrupt();
            self.release_computation();
        }

        ran && state == DeferredState::Pending
    }

    /// Attempts to cancel. Fails if the result already settled or is
    /// settling.
    ///
    /// With `may_interrupt`, the running thread (if any) is interrupted before
    /// any waiter is released.
    ///
    pub fn cancel(&self, may_interrupt: bool) -> bool {
        let target = if may_interrupt {
            DeferredState::CancelInProgress
        } else {
            DeferredState::Cancelled
        };

        if !self.state.transition(DeferredState::Pending, target) {
            return false;
        }

        if may_interrupt {
            {
                let guard = &epoch::pin();

                let runner = self.runner.load(Ordering::Acquire, guard);

                if let Some(runner) = unsafe { runner.as_ref() } {
                    runner.interrupt();
                    debug!(runner = ?runner.thread_id(), "interrupted deferred result runner");
                }
            }

            self.state.store(DeferredState::CancelledInterrupted);
        }

        self.finish_completion();

        true
    }

    /// Blocks until the result settles.
    ///
    /// Returns the value, `ComputationFailed` with the stored failure, or
    /// `Cancelled`. Fails with `Interrupted` if the calling thread is
    /// interrupted while waiting.
    ///
    pub fn get(&self) -> Result<T>
    where
        T: Clone,
    {
        let mut state = self.state.load();

        if !state.is_settled() {
            state = self.await_done(None)?;
        }

        self.report(state)
    }

    /// Like `get`, but fails with `Timeout` if the result does not settle
    /// within `timeout`. A timeout too large to form a deadline waits
    /// without one.
    ///
    pub fn get_timeout(&self, timeout: Duration) -> Result<T>
    where
        T: Clone,
    {
        let mut state = self.state.load();

        if !state.is_settled() {
            state = self.await_done(Instant::now().checked_add(timeout))?;

            if !state.is_settled() {
                return Err(CoordinationError::Timeout);
            }
        }

        self.report(state)
    }

    /// Non-blocking `get`. Returns `None` while the result has not settled.
    ///
    pub fn result_now(&self) -> Option<Result<T>>
    where
        T: Clone,
    {
        let state = self.state.load();

        state.is_settled().then(|| self.report(state))
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load() >= DeferredState::Cancelled
    }

    pub fn is_done(&self) -> bool {
        self.state.load() != DeferredState::Pending
    }

    pub fn deferred_state(&self) -> DeferredState {
        self.state.load()
    }

    pub fn state(&self) -> ResultState {
        match self.state.load() {
            DeferredState::Pending | DeferredState::Completing => ResultState::Running,
            DeferredState::Completed => ResultState::Success,
            DeferredState::Failed => ResultState::Failed,
            DeferredState::Cancelled
            | DeferredState::CancelInProgress
            | DeferredState::CancelledInterrupted => ResultState::Cancelled,
        }
    }

    fn set(&self, value: T) {
        if self
            .state
            .transition(DeferredState::Pending, DeferredState::Completing)
        {
            // SAFETY: winning the Completing CAS makes this the only writer,
            // and readers wait for the terminal state.
            //
            unsafe { *self.outcome.get() = Some(Ok(value)) };

            self.state.store(DeferredState::Completed);
            self.finish_completion();
        }
    }

    fn set_failure(&self, error: CoordinationError) {
        if self
            .state
            .transition(DeferredState::Pending, DeferredState::Completing)
        {
            // SAFETY: see `set`.
            //
            unsafe { *self.outcome.get() = Some(Err(error)) };

            self.state.store(DeferredState::Failed);
            self.finish_completion();
        }
    }

    // Releases waiters, runs the done hook and drops the computation.
    // Called once, by the thread that moved the state off Pending.
    //
    fn finish_completion(&self) {
        let woken = self.waiters.release_all();

        debug!(state = ?self.state.load(), woken, "deferred result settled");

        // SAFETY: only one thread ever reaches this point.
        //
        let hook = unsafe { (*self.done_hook.get()).take() };

        if let Some(hook) = hook {
            hook();
        }

        self.release_computation();
    }

    fn claim_runner(&self) -> Option<RunnerClaim<'_>> {
        let guard = &epoch::pin();

        let claimed = self
            .runner
            .compare_exchange(
                Shared::null(),
                Owned::new(ThreadSignal::current()),
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            )
            .is_ok();

        claimed.then(|| RunnerClaim {
            runner: &self.runner,
        })
    }

    // Drops the computation if no runner holds it. A busy runner drops it on
    // its way out.
    //
    fn release_computation(&self) {
        if let Some(_claim) = self.claim_runner() {
            // SAFETY: the runner claim gives exclusive access to the computation.
            //
            let computation = unsafe { (*self.computation.get()).take() };
            drop(computation);
        }
    }

    // Keeps the runner inside `run` until a concurrent `cancel(true)` has
    // delivered its interrupt.
    //
    fn wait_for_cancel_interrupt(&self) {
        while self.state.load() == DeferredState::CancelInProgress {
            thread::yield_now();
        }
    }

    fn await_done(&self, deadline: Option<Instant>) -> Result<DeferredState> {
        let mut slot: Option<Arc<WaitSlot>> = None;
        let mut queued = false;
        let mut spins = 0;

        loop {
            let state = self.state.load();

            if state.is_settled() {
                if let Some(slot) = &slot
                    && slot.abandon()
                {
                    self.waiters.purge();
                }

                return Ok(state);
            }

            if state.is_transient() && spins < COMPLETING_SPIN_LIMIT {
                // Settling never blocks; yield instead of parking.
                //
                spins += 1;
                thread::yield_now();
                continue;
            }

            if thread_signal::interrupted() {
                self.remove_waiter(slot.as_deref());
                return Err(CoordinationError::Interrupted);
            }

            let Some(waiter) = slot.as_ref() else {
                if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                    return Ok(state);
                }

                slot = Some(Arc::new(WaitSlot::for_current_thread()));
                continue;
            };

            if !queued {
                self.waiters.push(Arc::clone(waiter));
                queued = true;

                trace!(?state, "deferred result waiter queued");
                continue;
            }

            if let Some(deadline) = deadline
                && Instant::now() >= deadline
            {
                self.remove_waiter(Some(waiter.as_ref()));
                return Ok(state);
            }

            park(deadline);
        }
    }

    fn remove_waiter(&self, slot: Option<&WaitSlot>) {
        if let Some(slot) = slot {
            slot.abandon();
            self.waiters.purge();
        }
    }

    fn report(&self, state: DeferredState) -> Result<T>
    where
        T: Clone,
    {
        // SAFETY: the outcome is written before a Completed or Failed state
        // is published and never written again.
        //
        let outcome = unsafe { (*self.outcome.get()).as_ref() };

        match (state, outcome) {
            (DeferredState::Completed | DeferredState::Failed, Some(outcome)) => outcome.clone(),
            _ => Err(CoordinationError::Cancelled),
        }
    }
}

impl<T> Drop for DeferredResult<T> {
    fn drop(&mut self) {
        // Claims are scoped to a borrow of `self`, so the slot is normally
        // empty here.
        //
        unsafe {
            let guard = epoch::unprotected();

            let runner = self.runner.swap(Shared::null(), Ordering::Relaxed, guard);
            if !runner.is_null() {
                drop(runner.into_owned());
            }
        }
    }
}

impl<T> fmt::Debug for DeferredResult<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredResult")
            .field("state", &self.state.load())
            .finish_non_exhaustive()
    }
}
