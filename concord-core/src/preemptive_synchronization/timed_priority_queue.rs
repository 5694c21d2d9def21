//! Unbounded blocking queue of delayed items.
//!
//! Items become available when their deadline passes. The heap head is always
//! the item expiring first (ties broken by insertion order).
//!
//! # Leader/Follower
//!
//! Only one consumer, the leader, waits for the exact expiry of the head.
//! Every other consumer waits unconditionally until it is notified.
//!
//! ```text
//!   take()
//!     │
//!     ▼
//!   ┌──────────────┐ empty   ┌────────────────────────┐
//!   │ peek head    ├────────►│ wait                   │
//!   └──────┬───────┘         └────────────────────────┘
//!          │ expired         ┌────────────────────────┐
//!          ├────────────────►│ pop and return         │
//!          │                 └────────────────────────┘
//!          │ leader exists   ┌────────────────────────┐
//!          ├────────────────►│ wait (follower)        │
//!          │                 └────────────────────────┘
//!          │ no leader       ┌────────────────────────┐
//!          └────────────────►│ leader = self          │
//!                            │ wait_for(head delay)   │
//!                            │ leader = None          │
//!                            └────────────────────────┘
//! ```
//!
//! A new head clears the leader and wakes one consumer, since the old leader
//! is timing the wrong deadline. A consumer leaving `take` wakes a successor
//! when nobody leads and items remain.

use std::fmt;
use std::mem;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use binary_heap_plus::{BinaryHeap, MinComparator, PeekMut};
use parking_lot::{Mutex, MutexGuard};
use tracing::trace;

use crate::error::Result;
use crate::parking::condition::Condition;

/// An item that becomes available at a fixed instant.
///
/// The deadline is read once, when the item is inserted, and must not change
/// while the item is queued.
///
pub trait Delayed {
    fn expires_at(&self) -> Instant;

    /// Time left until the item expires, zero once it has.
    ///
    fn remaining_delay(&self) -> Duration {
        self.expires_at().saturating_duration_since(Instant::now())
    }
}

impl Delayed for Instant {
    fn expires_at(&self) -> Instant {
        *self
    }
}

/// Pairs a value with the instant it becomes available.
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayedItem<T> {
    value: T,
    expires_at: Instant,
}

impl<T> DelayedItem<T> {
    /// Item expiring `delay` from now. A delay past the clock's range
    /// saturates to the latest representable instant.
    ///
    pub fn new(value: T, delay: Duration) -> Self {
        let now = Instant::now();

        let mut horizon = delay;
        let expires_at = loop {
            if let Some(expires_at) = now.checked_add(horizon) {
                break expires_at;
            }

            horizon /= 2;
        };

        Self::at(value, expires_at)
    }

    pub fn at(value: T, expires_at: Instant) -> Self {
        DelayedItem { value, expires_at }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T> Delayed for DelayedItem<T> {
    fn expires_at(&self) -> Instant {
        self.expires_at
    }
}

struct DelayedEntry<T> {
    expires_at: Instant,
    sequence: u64,
    item: T,
}

impl<T> DelayedEntry<T> {
    #[inline]
    fn remaining_delay(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }
}

impl<T> Ord for DelayedEntry<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.expires_at
            .cmp(&other.expires_at)
            .then(self.sequence.cmp(&other.sequence))
    }
}

impl<T> Eq for DelayedEntry<T> {}

impl<T> PartialOrd for DelayedEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> PartialEq for DelayedEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.expires_at == other.expires_at && self.sequence == other.sequence
    }
}

struct QueueState<T> {
    heap: BinaryHeap<DelayedEntry<T>, MinComparator>,
    leader: Option<ThreadId>,
    next_sequence: u64,
}

impl<T> QueueState<T> {
    fn head_delay(&self) -> Option<Duration> {
        let now = Instant::now();

        self.heap.peek().map(|head| head.remaining_delay(now))
    }
}

pub struct TimedPriorityQueue<T: Delayed> {
    state: Mutex<QueueState<T>>,
    available: Condition,
}

impl<T: Delayed> TimedPriorityQueue<T> {
    pub fn new() -> Self {
        TimedPriorityQueue {
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new_min(),
                leader: None,
                next_sequence: 0,
            }),
            available: Condition::new(),
        }
    }

    /// Inserts an item. The queue is unbounded, so this always succeeds.
    ///
    pub fn offer(&self, item: T) -> bool {
        let mut state = self.state.lock();

        let sequence = state.next_sequence;
        state.next_sequence += 1;

        state.heap.push(DelayedEntry {
            expires_at: item.expires_at(),
            sequence,
            item,
        });

        let is_new_head = state
            .heap
            .peek()
            .is_some_and(|head| head.sequence == sequence);

        if is_new_head {
            // The current leader is timing a later deadline.
            //
            state.leader = None;
            self.available.notify_one();

            trace!(sequence, "new queue head");
        }

        true
    }

    /// Same as `offer`; never blocks.
    ///
    #[inline]
    pub fn put(&self, item: T) {
        self.offer(item);
    }

    /// Removes the head if it has expired.
    ///
    pub fn poll(&self) -> Option<T> {
        let mut state = self.state.lock();

        match state.head_delay() {
            Some(delay) if delay.is_zero() => state.heap.pop().map(|entry| entry.item),
            _ => None,
        }
    }

    /// Blocks until the head expires, then removes and returns it.
    ///
    /// Fails with `Interrupted` if the calling thread is interrupted.
    ///
    pub fn take(&self) -> Result<T> {
        let mut state = self.state.lock();

        let taken = self.take_internal(&mut state);
        self.signal_successor(&state);

        taken
    }

    /// Like `take`, but waits at most `timeout` in total. Returns `None` if no
    /// item expired within the budget.
    ///
    pub fn poll_timeout(&self, timeout: Duration) -> Result<Option<T>> {
        let mut state = self.state.lock();

        let polled = self.poll_timeout_internal(&mut state, timeout);
        self.signal_successor(&state);

        polled
    }

    /// Copies every item expired at call time, head first, into `sink`, and
    /// removes each one only after the sink accepted it. At most `limit`
    /// items are moved when a limit is given. Returns the number of items
    /// moved.
    ///
    /// If the sink panics, the item it was handed stays queued.
    ///
    pub fn drain_expired<E>(&self, sink: &mut E, limit: Option<usize>) -> usize
    where
        E: Extend<T>,
        T: Clone,
    {
        let limit = limit.unwrap_or(usize::MAX);

        let mut state = self.state.lock();
        let now = Instant::now();

        let mut drained = 0;

        while drained < limit {
            let Some(head) = state.heap.peek() else {
                break;
            };

            if head.expires_at > now {
                break;
            }

            let item = head.item.clone();
            sink.extend(Some(item));

            state.heap.pop();
            drained += 1;
        }

        drained
    }

    /// Hands every item expired at call time, head first, to `sink` by value.
    /// A sink that rejects an item returns it; the item goes back to the head
    /// of the queue and draining stops. Returns the number of items accepted.
    ///
    pub fn try_drain_expired<F>(&self, mut sink: F, limit: Option<usize>) -> usize
    where
        F: FnMut(T) -> std::result::Result<(), T>,
    {
        let limit = limit.unwrap_or(usize::MAX);

        let mut state = self.state.lock();
        let now = Instant::now();

        let mut drained = 0;

        while drained < limit {
            let Some(head) = state.heap.peek_mut() else {
                break;
            };

            if head.expires_at > now {
                break;
            }

            let DelayedEntry {
                expires_at,
                sequence,
                item,
            } = PeekMut::pop(head);

            if let Err(item) = sink(item) {
                // Same key, so it is the head again.
                //
                state.heap.push(DelayedEntry {
                    expires_at,
                    sequence,
                    item,
                });

                trace!(drained, "drain stopped by rejecting sink");
                break;
            }

            drained += 1;
        }

        drained
    }

    /// Returns a copy of the head, expired or not.
    ///
    pub fn peek(&self) -> Option<T>
    where
        T: Clone,
    {
        let state = self.state.lock();

        state.heap.peek().map(|head| head.item.clone())
    }

    /// Removes one item equal to `item`, expired or not.
    ///
    pub fn remove(&self, item: &T) -> bool
    where
        T: PartialEq,
    {
        let mut state = self.state.lock();

        let mut entries = mem::replace(&mut state.heap, BinaryHeap::new_min()).into_vec();

        let position = entries.iter().position(|entry| entry.item == *item);
        if let Some(position) = position {
            entries.swap_remove(position);
        }

        state.heap = BinaryHeap::from_vec_cmp(entries, MinComparator);

        position.is_some()
    }

    pub fn clear(&self) {
        self.state.lock().heap.clear();
    }

    pub fn len(&self) -> usize {
        self.state.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().heap.is_empty()
    }

    /// The queue is unbounded.
    ///
    pub fn remaining_capacity(&self) -> usize {
        usize::MAX
    }

    /// Point-in-time copy of the queued items, in no particular order.
    ///
    pub fn to_vec(&self) -> Vec<T>
    where
        T: Clone,
    {
        let state = self.state.lock();

        state.heap.iter().map(|entry| entry.item.clone()).collect()
    }

    fn take_internal(&self, state: &mut MutexGuard<'_, QueueState<T>>) -> Result<T> {
        let this_thread = thread::current().id();

        loop {
            match state.head_delay() {
                None => self.available.wait(state)?,
                Some(delay) if delay.is_zero() => {
                    if let Some(entry) = state.heap.pop() {
                        return Ok(entry.item);
                    }
                }
                Some(_) if state.leader.is_some() => self.available.wait(state)?,
                Some(delay) => {
                    state.leader = Some(this_thread);

                    let waited = self.available.wait_for(state, delay);

                    if state.leader == Some(this_thread) {
                        state.leader = None;
                    }

                    waited?;
                }
            }
        }
    }

    fn poll_timeout_internal(
        &self,
        state: &mut MutexGuard<'_, QueueState<T>>,
        timeout: Duration,
    ) -> Result<Option<T>> {
        let this_thread = thread::current().id();

        let mut remaining = timeout;

        loop {
            match state.head_delay() {
                None => {
                    if remaining.is_zero() {
                        return Ok(None);
                    }

                    remaining = self.available.wait_for(state, remaining)?;
                }
                Some(delay) if delay.is_zero() => {
                    if let Some(entry) = state.heap.pop() {
                        return Ok(Some(entry.item));
                    }
                }
                Some(_) if remaining.is_zero() => return Ok(None),
                Some(delay) if remaining < delay || state.leader.is_some() => {
                    remaining = self.available.wait_for(state, remaining)?;
                }
                Some(delay) => {
                    state.leader = Some(this_thread);

                    let waited = self.available.wait_for(state, delay);

                    if state.leader == Some(this_thread) {
                        state.leader = None;
                    }

                    let time_left = waited?;
                    remaining = remaining.saturating_sub(delay.saturating_sub(time_left));
                }
            }
        }
    }

    // Hands leadership on when the departing consumer leaves items behind.
    //
    fn signal_successor(&self, state: &QueueState<T>) {
        if state.leader.is_none() && !state.heap.is_empty() && self.available.notify_one() {
            trace!(remaining = state.heap.len(), "queue leadership handed off");
        }
    }
}

impl<T: Delayed> Default for TimedPriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, T: Delayed + Clone> IntoIterator for &'a TimedPriorityQueue<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.to_vec().into_iter()
    }
}

impl<T: Delayed> fmt::Debug for TimedPriorityQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();

        f.debug_struct("TimedPriorityQueue")
            .field("len", &state.heap.len())
            .field("leader", &state.leader)
            .finish()
    }
}
