//! One-shot counting gate.
//!
//! The gate opens when its count reaches zero and stays open forever. The
//! count is a lock-free atomic; blocked waiters park on a `WaitStack`.
//!
//! ```text
//!   count_down()                         wait()
//!   ┌─────────────────────────┐          ┌──────────────────────────┐
//!   │ CAS count: c -> c - 1   │          │ count == 0 ? return      │
//!   │ c == 1 ?                │          │ push WaitSlot            │
//!   │   release_all() ────────┼─────────►│ re-check count, park     │
//!   └─────────────────────────┘          └──────────────────────────┘
//! ```
//!
//! Waiters re-check the count after pushing their slot, so a release that
//! swaps the stack before the push is still observed.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::error::{CoordinationError, Result};
use crate::parking::thread_signal::{self, park};
use crate::parking::wait_slot::WaitSlot;
use crate::parking::wait_stack::WaitStack;

pub struct CountdownGate {
    count: AtomicUsize,
    waiters: WaitStack,
}

impl CountdownGate {
    // Create a new CountdownGate with initial count.
    //
    pub fn new(count: usize) -> Self {
        CountdownGate {
            count: AtomicUsize::new(count),
            waiters: WaitStack::new(),
        }
    }

    /// Decrements the count by one. Returns true if this call opened the gate.
    ///
    /// Calls made after the gate opened are no-ops.
    ///
    pub fn count_down(&self) -> bool {
        let mut count = self.count.load(Ordering::Acquire);

        loop {
            if count == 0 {
                return false;
            }

            match self.count.compare_exchange_weak(
                count,
                count - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(current) => count = current,
            }
        }

        if count != 1 {
            return false;
        }

        // This call drove the count to zero, release everyone.
        //
        let woken = self.waiters.release_all();
        debug!(woken, "countdown gate opened");

        true
    }

    /// Blocks until the count reaches zero.
    ///
    /// Fails with `Interrupted` if the calling thread is interrupted before or
    /// while waiting.
    ///
    pub fn wait(&self) -> Result<()> {
        self.wait_until(None).map(|_| ())
    }

    /// Blocks until the count reaches zero or the timeout elapses. Returns
    /// false on timeout. A timeout too large to form a deadline waits
    /// without one.
    ///
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool> {
        self.wait_until(Instant::now().checked_add(timeout))
    }

    /// Snapshot of the current count.
    ///
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.count() == 0
    }

    fn wait_until(&self, deadline: Option<Instant>) -> Result<bool> {
        if thread_signal::interrupted() {
            return Err(CoordinationError::Interrupted);
        }

        if self.is_open() {
            return Ok(true);
        }

        let slot = Arc::new(WaitSlot::for_current_thread());
        self.waiters.push(Arc::clone(&slot));

        trace!(count = self.count(), "countdown gate wait");

        loop {
            if self.is_open() {
                // Opened before the release reached our slot.
                //
                if slot.abandon() {
                    self.waiters.purge();
                }

                return Ok(true);
            }

            if thread_signal::is_current_interrupted() && slot.abandon() {
                thread_signal::interrupted();
                self.waiters.purge();

                return Err(CoordinationError::Interrupted);
            }

            if let Some(deadline) = deadline
                && Instant::now() >= deadline
                && slot.abandon()
            {
                self.waiters.purge();

                return Ok(false);
            }

            park(deadline);
        }
    }
}

impl TryFrom<i64> for CountdownGate {
    type Error = CoordinationError;

    fn try_from(count: i64) -> Result<Self> {
        let count = usize::try_from(count).map_err(|_| {
            CoordinationError::invalid_argument(format!("count must be >= 0, got {count}"))
        })?;

        Ok(CountdownGate::new(count))
    }
}

impl fmt::Display for CountdownGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CountdownGate[count = {}]", self.count())
    }
}

impl fmt::Debug for CountdownGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CountdownGate")
            .field("count", &self.count())
            .finish_non_exhaustive()
    }
}
