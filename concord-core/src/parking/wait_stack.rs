//! Lock-free stack of parked waiters (Treiber stack).
//!
//! Waiters push their `WaitSlot` at the head with a CAS. The thread that makes
//! the awaited condition true detaches the whole chain with one swap and
//! signals every slot in it. A waiter that gives up (timeout or interrupt)
//! abandons its slot and calls `purge`, which unlinks every slot that is no
//! longer waiting so the chain does not grow without bound.
//!
//! # Node Deletion
//!
//! Deletion uses the mark-then-unlink scheme of the sorted list: the tag bit
//! of a node's `next` pointer is the DELETE mark.
//!
//! ```text
//!   1. mark:    X.next  = Y | DELETE_MARK   (X is logically gone, X.next frozen)
//!   2. unlink:  pred.next: X -> Y           (CAS, pred.next must be unmarked)
//! ```
//!
//! Any thread may help unlink a marked node. The thread whose unlink CAS
//! succeeds owns the node and defers its destruction to the epoch collector.
//! A failed CAS means the neighbourhood changed; the traversal restarts from
//! the head.
//!
//! # Release
//!
//! ```text
//!   head ──► A ──► B ──► C         swap(head, null)
//!   walk:  signal(A), mark A.next, defer(A)
//!          signal(B), mark B.next, defer(B)   ...
//! ```
//!
//! Marking each link before moving on freezes the detached chain in front of
//! the walker, so a concurrent purge can never unlink (and free) a node the
//! walker is about to visit.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use crossbeam::epoch::{self, Atomic, Guard, Owned, Shared};

use crate::parking::wait_slot::WaitSlot;

const DELETE_MARK: usize = 0b1;

struct WaitNode {
    slot: Arc<WaitSlot>,
    next: Atomic<WaitNode>,
}

pub(crate) struct WaitStack {
    head: Atomic<WaitNode>,
}

impl WaitStack {
    pub(crate) fn new() -> Self {
        WaitStack {
            head: Atomic::null(),
        }
    }

    pub(crate) fn push(&self, slot: Arc<WaitSlot>) {
        let guard = &epoch::pin();

        let mut node = Owned::new(WaitNode {
            slot,
            next: Atomic::null(),
        });

        loop {
            let head = self.head.load(Ordering::Acquire, guard);
            node.next.store(head, Ordering::Relaxed);

            match self
                .head
                .compare_exchange(head, node, Ordering::AcqRel, Ordering::Acquire, guard)
            {
                Ok(_) => return,
                Err(error) => node = error.new,
            }
        }
    }

    /// Detaches every waiter and signals each one exactly once. Returns the
    /// number of threads woken.
    ///
    pub(crate) fn release_all(&self) -> usize {
        let guard = &epoch::pin();

        let mut woken = 0;
        let mut curr = self.head.swap(Shared::null(), Ordering::AcqRel, guard);

        while let Some(node) = unsafe { curr.as_ref() } {
            if node.slot.signal() {
                woken += 1;
            }

            // Freeze the link before leaving the node.
            //
            let next = node.next.fetch_or(DELETE_MARK, Ordering::AcqRel, guard);

            // SAFETY: the node was reached through the swapped head or a
            // frozen link, so this walker is the only thread that can unlink it.
            //
            unsafe { guard.defer_destroy(curr) };

            curr = next.with_tag(0);
        }

        woken
    }

    /// Unlinks every slot that is no longer waiting.
    ///
    pub(crate) fn purge(&self) {
        let guard = &epoch::pin();

        'retry: loop {
            let mut pred: &Atomic<WaitNode> = &self.head;
            let mut curr = pred.load(Ordering::Acquire, guard);

            while let Some(node) = unsafe { curr.as_ref() } {
                let next = node.next.load(Ordering::Acquire, guard);

                if next.tag() == DELETE_MARK {
                    // Logically deleted, help unlink it.
                    //
                    if !Self::unlink(pred, curr, next, guard) {
                        continue 'retry;
                    }

                    curr = next.with_tag(0);
                } else if !node.slot.is_waiting() {
                    // Mark and re-examine the same node.
                    //
                    _ = node.next.compare_exchange(
                        next,
                        next.with_tag(DELETE_MARK),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                        guard,
                    );
                } else {
                    pred = &node.next;
                    curr = next;
                }
            }

            return;
        }
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        let guard = &epoch::pin();

        self.head.load(Ordering::Acquire, guard).is_null()
    }

    // Number of linked nodes, including ones not yet unlinked.
    //
    #[cfg(test)]
    fn linked_len(&self) -> usize {
        let guard = &epoch::pin();

        let mut len = 0;
        let mut curr = self.head.load(Ordering::Acquire, guard);
        while let Some(node) = unsafe { curr.as_ref() } {
            len += 1;
            curr = node.next.load(Ordering::Acquire, guard).with_tag(0);
        }

        len
    }

    fn unlink<'g>(
        pred: &Atomic<WaitNode>,
        curr: Shared<'g, WaitNode>,
        marked_next: Shared<'g, WaitNode>,
        guard: &'g Guard,
    ) -> bool {
        let unlinked = pred
            .compare_exchange(
                curr,
                marked_next.with_tag(0),
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            )
            .is_ok();

        if unlinked {
            // SAFETY: the successful CAS removed the only link to `curr`, and
            // its frozen `next` means nobody can relink it.
            //
            unsafe { guard.defer_destroy(curr) };
        }

        unlinked
    }
}

impl Default for WaitStack {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WaitStack {
    fn drop(&mut self) {
        // Free whatever is still linked. Unlinked nodes were handed to the
        // epoch collector by whoever unlinked them.
        //
        unsafe {
            let guard = epoch::unprotected();

            let mut curr = self.head.load(Ordering::Relaxed, guard);
            while !curr.is_null() {
                let next = curr.deref().next.load(Ordering::Relaxed, guard);
                drop(curr.into_owned());
                curr = next.with_tag(0);
            }
        }
    }
}
