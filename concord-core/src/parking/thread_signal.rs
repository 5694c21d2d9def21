//! Per-thread interrupt flag and parker.
//!
//! Every thread that touches a concord primitive lazily gets a `ThreadSignal`
//! stored in thread local storage. The handle identifies the thread, carries
//! its interrupt flag and knows how to unpark it.
//!
//! ```text
//!   interrupt()                      parked thread
//!   ┌──────────────────────┐         ┌──────────────────────────┐
//!   │ interrupted = true   │         │ park(deadline)           │
//!   │ unparker.unpark() ───┼────────►│ wakes, re-checks its     │
//!   └──────────────────────┘         │ predicate and the flag   │
//!                                    └──────────────────────────┘
//! ```
//!
//! Unpark before park is remembered by the parker token, so an interrupt that
//! races with a thread about to park is never lost.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, ThreadId};
use std::time::Instant;

use crossbeam::sync::{Parker, Unparker};

struct SignalInner {
    interrupted: AtomicBool,
    unparker: Unparker,
    thread_id: ThreadId,
    thread_name: Option<String>,
}

/// Clonable handle naming a thread that can be interrupted and unparked.
///
#[derive(Clone)]
pub struct ThreadSignal {
    inner: Arc<SignalInner>,
}

struct LocalSignal {
    parker: Parker,
    signal: ThreadSignal,
}

impl LocalSignal {
    fn new() -> Self {
        let parker = Parker::new();
        let current = thread::current();

        let signal = ThreadSignal {
            inner: Arc::new(SignalInner {
                interrupted: AtomicBool::new(false),
                unparker: parker.unparker().clone(),
                thread_id: current.id(),
                thread_name: current.name().map(str::to_owned),
            }),
        };

        LocalSignal { parker, signal }
    }
}

thread_local! {
    static LOCAL_SIGNAL: LocalSignal = LocalSignal::new();
}

impl ThreadSignal {
    /// Returns the handle of the calling thread.
    ///
    pub fn current() -> Self {
        LOCAL_SIGNAL.with(|local| local.signal.clone())
    }

    /// Delivers an interrupt to the thread.
    ///
    /// The flag is set before the thread is unparked so a woken waiter always
    /// observes it.
    ///
    pub fn interrupt(&self) {
        self.inner.interrupted.store(true, Ordering::Release);
        self.inner.unparker.unpark();
    }

    /// Returns whether an interrupt is pending, without clearing it.
    ///
    pub fn is_interrupted(&self) -> bool {
        self.inner.interrupted.load(Ordering::Acquire)
    }

    pub fn thread_id(&self) -> ThreadId {
        self.inner.thread_id
    }

    pub fn thread_name(&self) -> Option<&str> {
        self.inner.thread_name.as_deref()
    }

    pub(crate) fn unpark(&self) {
        self.inner.unparker.unpark();
    }

    fn take_interrupt(&self) -> bool {
        self.inner.interrupted.swap(false, Ordering::AcqRel)
    }
}

impl PartialEq for ThreadSignal {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for ThreadSignal {}

impl fmt::Debug for ThreadSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadSignal")
            .field("thread_id", &self.inner.thread_id)
            .field("thread_name", &self.inner.thread_name)
            .field("interrupted", &self.is_interrupted())
            .finish()
    }
}

/// Tests and clears the interrupt flag of the calling thread.
///
pub fn interrupted() -> bool {
    LOCAL_SIGNAL.with(|local| local.signal.take_interrupt())
}

/// Returns whether the calling thread has a pending interrupt.
///
pub fn is_current_interrupted() -> bool {
    LOCAL_SIGNAL.with(|local| local.signal.is_interrupted())
}

/// Parks the calling thread until it is unparked, the deadline passes, or a
/// spurious wakeup happens. Callers re-check their predicate in a loop.
///
pub(crate) fn park(deadline: Option<Instant>) {
    LOCAL_SIGNAL.with(|local| match deadline {
        Some(deadline) => local.parker.park_deadline(deadline),
        None => local.parker.park(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn handles_of_same_thread_are_equal() {
        let first = ThreadSignal::current();
        let second = ThreadSignal::current();

        assert_eq!(first, second);
        assert_eq!(thread::current().id(), first.thread_id());

        let other = thread::spawn(ThreadSignal::current).join().unwrap();
        assert_ne!(first, other);
    }

    #[test]
    fn interrupted_clears_the_flag() {
        let signal = ThreadSignal::current();

        signal.interrupt();
        assert!(is_current_interrupted());
        assert!(interrupted());
        assert!(!interrupted());
        assert!(!signal.is_interrupted());
    }

    #[test]
    fn interrupt_before_park_is_remembered() {
        ThreadSignal::current().interrupt();

        let start = Instant::now();
        park(Some(start + Duration::from_secs(10)));

        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(interrupted());
    }

    #[test]
    fn interrupt_wakes_parked_thread() {
        let (sender, receiver) = std::sync::mpsc::channel();

        let handle = thread::spawn(move || {
            sender.send(ThreadSignal::current()).unwrap();

            while !is_current_interrupted() {
                park(None);
            }

            interrupted()
        });

        let signal = receiver.recv().unwrap();
        thread::sleep(Duration::from_millis(20));
        signal.interrupt();

        assert!(handle.join().unwrap());
    }
}
