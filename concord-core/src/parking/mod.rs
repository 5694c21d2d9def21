//! Low-level facilities shared by the coordination primitives.
//!
//! - [`thread_signal`] - per-thread interrupt flag and parker
//! - `wait_slot` - one parked waiter record
//! - `condition` - interrupt-aware condition variable over a `parking_lot` mutex
//! - `wait_stack` - lock-free Treiber stack of waiter records

pub(crate) mod condition;
pub mod thread_signal;
pub(crate) mod wait_slot;
pub(crate) mod wait_stack;

pub use thread_signal::ThreadSignal;
