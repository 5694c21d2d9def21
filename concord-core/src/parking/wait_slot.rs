use std::sync::atomic::{AtomicU8, Ordering};

use crate::parking::thread_signal::ThreadSignal;

const WAITING: u8 = 0;
const SIGNALED: u8 = 1;
const ABANDONED: u8 = 2;

// One parked waiter.
//
// The slot leaves WAITING exactly once: a waker moves it to SIGNALED and
// unparks the owner, or the owner moves it to ABANDONED when it gives up
// (timeout or interrupt). Whoever wins the CAS owns the outcome.
//
pub(crate) struct WaitSlot {
    state: AtomicU8,
    thread: ThreadSignal,
}

impl WaitSlot {
    pub(crate) fn for_current_thread() -> Self {
        WaitSlot {
            state: AtomicU8::new(WAITING),
            thread: ThreadSignal::current(),
        }
    }

    /// Wakes the owner. Returns false if the slot was already signaled or
    /// abandoned.
    ///
    pub(crate) fn signal(&self) -> bool {
        let won = self
            .state
            .compare_exchange(WAITING, SIGNALED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();

        if won {
            self.thread.unpark();
        }

        won
    }

    /// Withdraws the owner. Returns false if a waker signaled first.
    ///
    pub(crate) fn abandon(&self) -> bool {
        self.state
            .compare_exchange(WAITING, ABANDONED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    pub(crate) fn is_waiting(&self) -> bool {
        self.state.load(Ordering::Acquire) == WAITING
    }

    #[inline]
    pub(crate) fn is_signaled(&self) -> bool {
        self.state.load(Ordering::Acquire) == SIGNALED
    }
}
