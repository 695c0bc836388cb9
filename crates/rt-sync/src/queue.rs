//! Michael–Scott lock-free FIFO queue.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::Ordering;

use crossbeam_epoch::{self as epoch, Atomic, Owned};

struct Node<T> {
    data: UnsafeCell<MaybeUninit<T>>,
    next: Atomic<Node<T>>,
}

impl<T> Node<T> {
    fn sentinel() -> Self {
        Self { data: UnsafeCell::new(MaybeUninit::uninit()), next: Atomic::null() }
    }
}

/// A lock-free, linearisable FIFO queue following Michael & Scott (1996).
///
/// A persistent sentinel node always sits at `head`; the value of the
/// logical front element lives in `head.next`. Enqueue advances `tail` in
/// two steps (link, then swing) and dequeue helps a lagging `tail` catch
/// up when it has fallen behind `head`, exactly as the cited algorithm
/// describes.
pub struct LockFreeQueue<T> {
    head: Atomic<Node<T>>,
    tail: Atomic<Node<T>>,
}

// SAFETY: see `LockFreeStack`; values only ever move between threads
// through node ownership transfer.
unsafe impl<T: Send> Send for LockFreeQueue<T> {}
unsafe impl<T: Send> Sync for LockFreeQueue<T> {}

impl<T> Default for LockFreeQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LockFreeQueue<T> {
    /// Creates an empty queue with a fresh sentinel node.
    #[must_use]
    pub fn new() -> Self {
        let guard = epoch::pin();
        let sentinel = Owned::new(Node::sentinel()).into_shared(&guard);
        Self { head: Atomic::from(sentinel), tail: Atomic::from(sentinel) }
    }

    /// Appends `value` to the back of the queue.
    pub fn enqueue(&self, value: T) {
        let guard = epoch::pin();
        let new_node = Owned::new(Node {
            data: UnsafeCell::new(MaybeUninit::new(value)),
            next: Atomic::null(),
        })
        .into_shared(&guard);

        loop {
            let tail = self.tail.load(Ordering::Acquire, &guard);
            // SAFETY: `tail` is never null and always points to a live node;
            // nodes are only reclaimed after being unlinked from both ends.
            let tail_ref = unsafe { tail.deref() };
            let next = tail_ref.next.load(Ordering::Acquire, &guard);

            if next.is_null() {
                // Tail looks current: try to link the new node after it.
                if tail_ref
                    .next
                    .compare_exchange(next, new_node, Ordering::Release, Ordering::Relaxed, &guard)
                    .is_ok()
                {
                    // Best-effort: swing tail forward. If this CAS loses,
                    // the next enqueue or dequeue will finish the job.
                    let _ = self.tail.compare_exchange(
                        tail,
                        new_node,
                        Ordering::Release,
                        Ordering::Relaxed,
                        &guard,
                    );
                    return;
                }
            } else {
                // Tail is lagging behind the real last node: help it along.
                let _ = self.tail.compare_exchange(
                    tail,
                    next,
                    Ordering::Release,
                    Ordering::Relaxed,
                    &guard,
                );
            }
        }
    }

    /// Removes and returns the value at the front of the queue, or `None`
    /// if it is empty.
    pub fn dequeue(&self) -> Option<T> {
        let guard = epoch::pin();
        loop {
            let head = self.head.load(Ordering::Acquire, &guard);
            let tail = self.tail.load(Ordering::Acquire, &guard);
            // SAFETY: head always points at a live sentinel or ex-sentinel node.
            let head_ref = unsafe { head.deref() };
            let next = head_ref.next.load(Ordering::Acquire, &guard);

            if head != self.head.load(Ordering::Acquire, &guard) {
                continue;
            }

            if head == tail {
                if next.is_null() {
                    return None;
                }
                // Tail lagging one behind head: help it catch up and retry.
                let _ = self.tail.compare_exchange(
                    tail,
                    next,
                    Ordering::Release,
                    Ordering::Relaxed,
                    &guard,
                );
                continue;
            }

            let Some(next_ref) = (unsafe { next.as_ref() }) else { continue };
            if self
                .head
                .compare_exchange(head, next, Ordering::Release, Ordering::Relaxed, &guard)
                .is_ok()
            {
                // SAFETY: we won the CAS that retires `head`; its successor
                // `next` becomes the new sentinel and its data slot is ours
                // to read exactly once.
                let value = unsafe { (*next_ref.data.get()).as_ptr().read() };
                // The *previous* dummy (`head`) is freed, never the node we
                // just promoted to sentinel.
                unsafe { guard.defer_destroy(head) };
                return Some(value);
            }
        }
    }

    /// Returns `true` if the queue currently has no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        let guard = epoch::pin();
        let head = self.head.load(Ordering::Acquire, &guard);
        let head_ref = unsafe { head.deref() };
        head_ref.next.load(Ordering::Acquire, &guard).is_null()
    }
}

impl<T> Drop for LockFreeQueue<T> {
    fn drop(&mut self) {
        while self.dequeue().is_some() {}
        // Free the remaining sentinel node.
        let guard = epoch::pin();
        let head = self.head.load(Ordering::Relaxed, &guard);
        unsafe { guard.defer_destroy(head) };
    }
}
