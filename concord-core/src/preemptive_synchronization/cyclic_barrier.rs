//! Reusable rendezvous barrier.
//!
//! `parties` threads meet at the barrier once per generation. The last thread
//! to arrive (the trip thread) runs the optional action under the barrier
//! lock, then starts the next generation and wakes everyone.
//!
//! # Generations
//!
//! ```text
//!   generation N                         generation N + 1
//!   ┌────────────────────────┐  trip     ┌────────────────────────┐
//!   │ count: parties -> 0    ├──────────►│ count = parties        │
//!   │ broken: false          │           │ fresh Generation token │
//!   └──────────┬─────────────┘           └────────────────────────┘
//!              │ timeout / interrupt / action failure / reset
//!              ▼
//!   ┌────────────────────────┐
//!   │ broken: true           │  waiters of N fail with BrokenBarrier
//!   └────────────────────────┘
//! ```
//!
//! A waiter captures the `Arc<Generation>` it arrived in. After waking it
//! compares that token against the current one by identity: a replaced token
//! means its trip completed, a broken token means it must fail.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{BoxError, CoordinationError, Result};
use crate::parking::condition::Condition;
use crate::parking::thread_signal::{self, ThreadSignal};

type BarrierAction = Box<dyn FnMut() -> std::result::Result<(), BoxError> + Send>;

#[derive(Default)]
struct Generation {
    // Written under the barrier lock only.
    //
    broken: AtomicBool,
}

impl Generation {
    #[inline]
    fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Relaxed)
    }
}

struct BarrierState {
    count: usize,
    generation: Arc<Generation>,
    action: Option<BarrierAction>,
}

pub struct CyclicBarrier {
    parties: usize,
    state: Mutex<BarrierState>,
    trip: Condition,
}

impl CyclicBarrier {
    /// Creates a barrier for `parties` threads.
    ///
    pub fn new(parties: usize) -> Result<Self> {
        Self::create(parties, None)
    }

    /// Creates a barrier that runs `action` on the trip thread each time the
    /// barrier trips, before any waiter is released.
    ///
    /// If the action fails or panics the barrier is broken, the trip thread
    /// receives `ComputationFailed` and every other waiter `BrokenBarrier`.
    ///
    pub fn with_action<F, E>(parties: usize, mut action: F) -> Result<Self>
    where
        F: FnMut() -> std::result::Result<(), E> + Send + 'static,
        E: Into<BoxError>,
    {
        Self::create(
            parties,
            Some(Box::new(move || action().map_err(Into::into))),
        )
    }

    fn create(parties: usize, action: Option<BarrierAction>) -> Result<Self> {
        if parties == 0 {
            return Err(CoordinationError::invalid_argument(
                "barrier requires at least 1 party",
            ));
        }

        Ok(CyclicBarrier {
            parties,
            state: Mutex::new(BarrierState {
                count: parties,
                generation: Arc::new(Generation::default()),
                action,
            }),
            trip: Condition::new(),
        })
    }

    /// Waits until all parties have arrived.
    ///
    /// Returns the arrival index: `parties - 1` for the first thread to
    /// arrive, 0 for the trip thread.
    ///
    pub fn wait(&self) -> Result<usize> {
        self.wait_internal(None)
    }

    /// Waits until all parties have arrived or the timeout elapses. On
    /// timeout the barrier is broken and `Timeout` is returned.
    ///
    pub fn wait_timeout(&self, timeout: Duration) -> Result<usize> {
        self.wait_internal(Some(timeout))
    }

    /// Breaks the current generation, failing its waiters with
    /// `BrokenBarrier`, and starts a fresh one.
    ///
    pub fn reset(&self) {
        let mut state = self.state.lock();

        self.break_barrier(&mut state, "reset");
        self.next_generation(&mut state);
    }

    pub fn parties(&self) -> usize {
        self.parties
    }

    /// Number of parties currently waiting at the barrier.
    ///
    pub fn number_waiting(&self) -> usize {
        let state = self.state.lock();

        self.parties - state.count
    }

    pub fn is_broken(&self) -> bool {
        let state = self.state.lock();

        state.generation.is_broken()
    }

    fn wait_internal(&self, timeout: Option<Duration>) -> Result<usize> {
        let mut state = self.state.lock();

        let generation = Arc::clone(&state.generation);

        if generation.is_broken() {
            return Err(CoordinationError::BrokenBarrier);
        }

        if thread_signal::interrupted() {
            self.break_barrier(&mut state, "interrupted before arrival");
            return Err(CoordinationError::Interrupted);
        }

        state.count -= 1;
        let index = state.count;

        if index == 0 {
            return self.trip_barrier(&mut state);
        }

        trace!(index, parties = self.parties, "barrier arrival");

        // Budget left for a timed wait, decremented across wakeups.
        //
        let mut remaining = timeout;

        loop {
            let waited = match remaining {
                None => self.trip.wait(&mut state),
                Some(budget) if budget.is_zero() => Ok(()),
                Some(budget) => match self.trip.wait_for(&mut state, budget) {
                    Ok(left) => {
                        remaining = Some(left);
                        Ok(())
                    }
                    Err(error) => Err(error),
                },
            };

            if let Err(error) = waited {
                if Arc::ptr_eq(&generation, &state.generation) && !generation.is_broken() {
                    self.break_barrier(&mut state, "interrupted while waiting");
                    return Err(error);
                }

                // The trip already completed or broke; keep the interrupt for
                // the caller's next blocking call.
                //
                ThreadSignal::current().interrupt();
            }

            if generation.is_broken() {
                return Err(CoordinationError::BrokenBarrier);
            }

            if !Arc::ptr_eq(&generation, &state.generation) {
                return Ok(index);
            }

            if remaining.is_some_and(|budget| budget.is_zero()) {
                self.break_barrier(&mut state, "timed out");
                return Err(CoordinationError::Timeout);
            }
        }
    }

    // Runs the action on the trip thread and advances the generation.
    //
    fn trip_barrier(&self, state: &mut BarrierState) -> Result<usize> {
        let outcome = match state.action.as_mut() {
            Some(action) => match panic::catch_unwind(AssertUnwindSafe(|| action())) {
                Ok(Ok(())) => Ok(()),
                Ok(Err(error)) => Err(CoordinationError::computation_failed(error)),
                Err(payload) => Err(CoordinationError::panicked(payload)),
            },
            None => Ok(()),
        };

        match outcome {
            Ok(()) => {
                self.next_generation(state);
                debug!(parties = self.parties, "barrier tripped");

                Ok(0)
            }
            Err(error) => {
                self.break_barrier(state, "barrier action failed");

                Err(error)
            }
        }
    }

    fn next_generation(&self, state: &mut BarrierState) {
        self.trip.notify_all();

        state.count = self.parties;
        state.generation = Arc::new(Generation::default());
    }

    fn break_barrier(&self, state: &mut BarrierState, reason: &'static str) {
        state.generation.broken.store(true, Ordering::Relaxed);
        state.count = self.parties;

        let woken = self.trip.notify_all();
        debug!(reason, woken, "barrier broken");
    }
}

impl fmt::Debug for CyclicBarrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();

        f.debug_struct("CyclicBarrier")
            .field("parties", &self.parties)
            .field("waiting", &(self.parties - state.count))
            .field("broken", &state.generation.is_broken())
            .finish()
    }
}
