//! Thread coordination primitives with cooperative interruption.
//!
//! # Organization
//!
//! - [`preemptive_synchronization`] - Gate, barrier, delay queue and deferred result
//! - [`parking`] - Per-thread interrupt signal and the waiter plumbing behind it
//! - [`error`] - Error type returned by every blocking operation
//!
//! Blocking operations observe interrupts delivered through
//! [`ThreadSignal::interrupt`]. An interrupted wait returns
//! [`CoordinationError::Interrupted`] and clears the flag.

pub mod error;
pub mod parking;
pub mod preemptive_synchronization;

pub use error::{BoxError, CoordinationError, Panicked, Result};
pub use parking::ThreadSignal;
pub use parking::thread_signal::{interrupted, is_current_interrupted};
pub use preemptive_synchronization::{
    CountdownGate, CyclicBarrier, DeferredResult, DeferredState, Delayed, DelayedItem,
    ResultState, TimedPriorityQueue,
};

/*

cargo llvm-cov --html

sudo CARGO_PROFILE_RELEASE_DEBUG=true cargo flamegraph --bench primitives_benchmark --root --

*/
