//! Interrupt-aware condition variable.
//!
//! `Condition` pairs with a `parking_lot::Mutex` the same way a `Condvar`
//! does, but the waiting thread parks on its own `ThreadSignal`, so an
//! interrupt delivered to it wakes the wait.
//!
//! # Wait Flow
//!
//! ```text
//!   holder of the mutex
//!         │
//!         ▼
//!   ┌─────────────────────────┐
//!   │ enqueue WaitSlot        │  (still holding the mutex, so no
//!   └───────────┬─────────────┘   notifier can miss it)
//!               ▼
//!   ┌─────────────────────────┐
//!   │ unlock, park until      │
//!   │ signaled / interrupted /│
//!   │ deadline                │
//!   └───────────┬─────────────┘
//!               ▼
//!   ┌─────────────────────────┐
//!   │ relock, drop own slot   │
//!   │ if it was not signaled  │
//!   └─────────────────────────┘
//! ```
//!
//! A timed-out or interrupted waiter abandons its slot with a CAS. If a
//! notifier won that CAS first, the wait counts as notified and a pending
//! interrupt stays set for the caller to observe later.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};

use crate::error::{CoordinationError, Result};
use crate::parking::thread_signal::{self, park};
use crate::parking::wait_slot::WaitSlot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wakeup {
    Notified,
    TimedOut,
    Interrupted,
}

#[derive(Default)]
pub(crate) struct Condition {
    waiters: Mutex<VecDeque<Arc<WaitSlot>>>,
}

impl Condition {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Waits until notified or interrupted.
    ///
    pub(crate) fn wait<T>(&self, guard: &mut MutexGuard<'_, T>) -> Result<()> {
        self.wait_until(guard, None).map(|_| ())
    }

    /// Waits at most `timeout`. Returns the unused part of the budget, zero
    /// when the wait timed out.
    ///
    pub(crate) fn wait_for<T>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        timeout: Duration,
    ) -> Result<Duration> {
        if timeout.is_zero() {
            if thread_signal::interrupted() {
                return Err(CoordinationError::Interrupted);
            }

            return Ok(Duration::ZERO);
        }

        // A budget past the clock's range is an untimed wait.
        //
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            self.wait_until(guard, None)?;
            return Ok(timeout);
        };

        self.wait_until(guard, Some(deadline))?;

        Ok(deadline.saturating_duration_since(Instant::now()))
    }

    /// Wakes one waiter. Abandoned slots are skipped.
    ///
    pub(crate) fn notify_one(&self) -> bool {
        let mut waiters = self.waiters.lock();

        while let Some(slot) = waiters.pop_front() {
            if slot.signal() {
                return true;
            }
        }

        false
    }

    /// Wakes every waiter, returns how many were woken.
    ///
    pub(crate) fn notify_all(&self) -> usize {
        let mut waiters = self.waiters.lock();

        waiters.drain(..).filter(|slot| slot.signal()).count()
    }

    #[cfg(test)]
    fn has_waiters(&self) -> bool {
        self.waiters.lock().iter().any(|slot| slot.is_waiting())
    }

    // Returns Ok(true) when notified, Ok(false) on deadline.
    //
    fn wait_until<T>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        deadline: Option<Instant>,
    ) -> Result<bool> {
        if thread_signal::interrupted() {
            return Err(CoordinationError::Interrupted);
        }

        let slot = Arc::new(WaitSlot::for_current_thread());
        self.waiters.lock().push_back(Arc::clone(&slot));

        let wakeup = MutexGuard::unlocked(guard, || Self::park_on(&slot, deadline));

        if wakeup != Wakeup::Notified {
            // Notifiers pop signaled slots; an abandoned one is still queued.
            //
            self.waiters
                .lock()
                .retain(|queued| !Arc::ptr_eq(queued, &slot));
        }

        match wakeup {
            Wakeup::Notified => Ok(true),
            Wakeup::TimedOut => Ok(false),
            Wakeup::Interrupted => Err(CoordinationError::Interrupted),
        }
    }

    fn park_on(slot: &WaitSlot, deadline: Option<Instant>) -> Wakeup {
        loop {
            if slot.is_signaled() {
                return Wakeup::Notified;
            }

            if thread_signal::is_current_interrupted() {
                if slot.abandon() {
                    thread_signal::interrupted();
                    return Wakeup::Interrupted;
                }

                return Wakeup::Notified;
            }

            if let Some(deadline) = deadline
                && Instant::now() >= deadline
            {
                if slot.abandon() {
                    return Wakeup::TimedOut;
                }

                return Wakeup::Notified;
            }

            park(deadline);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parking::thread_signal::ThreadSignal;
    use std::thread;

    #[test]
    fn wait_for_times_out_with_zero_remaining() {
        let lock = Mutex::new(());
        let condition = Condition::new();

        let mut guard = lock.lock();
        let remaining = condition
            .wait_for(&mut guard, Duration::from_millis(20))
            .unwrap();

        assert_eq!(Duration::ZERO, remaining);
        assert!(!condition.has_waiters());
    }

    #[test]
    fn pending_interrupt_fails_wait_immediately() {
        let lock = Mutex::new(());
        let condition = Condition::new();

        ThreadSignal::current().interrupt();

        let mut guard = lock.lock();
        let result = condition.wait(&mut guard);

        assert!(matches!(result, Err(CoordinationError::Interrupted)));
        assert!(!thread_signal::is_current_interrupted());
    }

    #[test]
    fn notify_one_wakes_waiter() {
        let shared = Arc::new((Mutex::new(false), Condition::new()));

        let waiter = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                let (lock, condition) = &*shared;
                let mut ready = lock.lock();
                while !*ready {
                    condition.wait(&mut ready).unwrap();
                }
            })
        };

        thread::sleep(Duration::from_millis(20));

        {
            let (lock, condition) = &*shared;
            let mut ready = lock.lock();
            *ready = true;
            condition.notify_one();
        }

        waiter.join().unwrap();
    }

    #[test]
    fn interrupt_wakes_waiter_with_error() {
        let shared = Arc::new((Mutex::new(()), Condition::new()));
        let (sender, receiver) = std::sync::mpsc::channel();

        let waiter = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                sender.send(ThreadSignal::current()).unwrap();
                let (lock, condition) = &*shared;
                let mut guard = lock.lock();
                condition.wait(&mut guard)
            })
        };

        let signal = receiver.recv().unwrap();
        thread::sleep(Duration::from_millis(20));
        signal.interrupt();

        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(CoordinationError::Interrupted)));
        assert!(!shared.1.has_waiters());
    }

    #[test]
    fn notified_waiter_keeps_late_interrupt() {
        let shared = Arc::new((Mutex::new(()), Condition::new()));
        let (sender, receiver) = std::sync::mpsc::channel();

        let waiter = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                sender.send(ThreadSignal::current()).unwrap();
                let (lock, condition) = &*shared;
                let mut guard = lock.lock();
                let result = condition.wait(&mut guard);
                (result, thread_signal::is_current_interrupted())
            })
        };

        let signal = receiver.recv().unwrap();

        {
            let (lock, condition) = &*shared;
            while !condition.has_waiters() {
                thread::yield_now();
            }

            // Notify and interrupt while the waiter cannot run past the lock.
            //
            let _guard = lock.lock();
            assert_eq!(1, condition.notify_all());
            signal.interrupt();
        }

        let (result, still_interrupted) = waiter.join().unwrap();

        assert!(result.is_ok());
        assert!(still_interrupted);
    }

    #[test]
    fn wait_for_beyond_clock_range_waits_untimed() {
        let shared = Arc::new((Mutex::new(false), Condition::new()));

        let notifier = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                let (lock, condition) = &*shared;
                let mut ready = lock.lock();
                *ready = true;
                condition.notify_one();
            })
        };

        let (lock, condition) = &*shared;
        let mut ready = lock.lock();
        while !*ready {
            let remaining = condition.wait_for(&mut ready, Duration::MAX).unwrap();
            assert_eq!(Duration::MAX, remaining);
        }
        drop(ready);

        notifier.join().unwrap();
    }
}
