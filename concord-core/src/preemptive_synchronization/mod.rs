//! Blocking coordination primitives for preemptively scheduled threads.
//!
//! # Organization
//!
//! - [`countdown_gate`] - One-shot gate opened by counting down to zero
//! - [`cyclic_barrier`] - Reusable rendezvous for a fixed number of parties
//! - [`timed_priority_queue`] - Blocking queue releasing items at their deadline
//! - [`deferred_result`] - Cancellable result of a computation run elsewhere

pub mod countdown_gate;
pub mod cyclic_barrier;
pub mod deferred_result;
pub mod timed_priority_queue;

pub use countdown_gate::CountdownGate;
pub use cyclic_barrier::CyclicBarrier;
pub use deferred_result::{COMPLETING_SPIN_LIMIT, DeferredResult, DeferredState, ResultState};
pub use timed_priority_queue::{Delayed, DelayedItem, TimedPriorityQueue};
