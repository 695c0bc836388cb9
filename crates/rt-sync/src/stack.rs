//! Treiber stack: a lock-free LIFO pool.

use std::mem::MaybeUninit;
use std::sync::atomic::Ordering;

use crossbeam_epoch::{self as epoch, Atomic, Owned};
use std::cell::UnsafeCell;

struct Node<T> {
    data: UnsafeCell<MaybeUninit<T>>,
    next: Atomic<Node<T>>,
}

/// A lock-free, linearisable LIFO stack.
///
/// Used by [`rt-job`](https://docs.rs/rt-job)'s per-kernel free-slot pools:
/// pushing back a released slot and popping a free one are both
/// constant-time and never block.
pub struct LockFreeStack<T> {
    head: Atomic<Node<T>>,
}

// SAFETY: `T: Send` is sufficient — the stack never exposes `&T` across
// threads without transferring ownership of the node holding it.
unsafe impl<T: Send> Send for LockFreeStack<T> {}
unsafe impl<T: Send> Sync for LockFreeStack<T> {}

impl<T> Default for LockFreeStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LockFreeStack<T> {
    /// Creates an empty stack.
    #[must_use]
    pub fn new() -> Self {
        Self { head: Atomic::null() }
    }

    /// Pushes `value` onto the top of the stack.
    pub fn push(&self, value: T) {
        let guard = epoch::pin();
        let mut new_node = Owned::new(Node {
            data: UnsafeCell::new(MaybeUninit::new(value)),
            next: Atomic::null(),
        });
        loop {
            let head = self.head.load(Ordering::Acquire, &guard);
            new_node.next.store(head, Ordering::Relaxed);
            match self
                .head
                .compare_exchange(head, new_node, Ordering::Release, Ordering::Relaxed, &guard)
            {
                Ok(_) => return,
                Err(err) => new_node = err.new,
            }
        }
    }

    /// Pops the top-most value, or `None` if the stack is empty.
    pub fn pop(&self) -> Option<T> {
        let guard = epoch::pin();
        loop {
            let head = self.head.load(Ordering::Acquire, &guard);
            let head_ref = unsafe { head.as_ref() }?;
            let next = head_ref.next.load(Ordering::Relaxed, &guard);
            if self
                .head
                .compare_exchange(head, next, Ordering::Release, Ordering::Relaxed, &guard)
                .is_ok()
            {
                // SAFETY: we won the CAS, so this thread is the sole logical
                // owner of `head`'s payload; no other pop can observe it.
                let value = unsafe { (*head_ref.data.get()).as_ptr().read() };
                // SAFETY: the node is unlinked and will not be dereferenced
                // again; epoch reclamation frees it once no guard overlaps.
                unsafe { guard.defer_destroy(head) };
                return Some(value);
            }
        }
    }

    /// Returns `true` if the stack currently has no elements.
    ///
    /// Racy under concurrent use: by the time the caller observes the
    /// result another thread may have pushed or popped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        let guard = epoch::pin();
        self.head.load(Ordering::Acquire, &guard).is_null()
    }
}

impl<T> Drop for LockFreeStack<T> {
    fn drop(&mut self) {
        // Single-threaded at this point (we own `&mut self`), so a plain
        // pop loop without epoch pinning ceremony is sufficient and avoids
        // leaving pinned guards around during teardown.
        while self.pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn push_pop_lifo_order() {
        let s = LockFreeStack::new();
        s.push(1);
        s.push(2);
        s.push(3);
        assert_eq!(s.pop(), Some(3));
        assert_eq!(s.pop(), Some(2));
        assert_eq!(s.pop(), Some(1));
        assert_eq!(s.pop(), None);
    }

    #[test]
    fn empty_pop_returns_none() {
        let s: LockFreeStack<u32> = LockFreeStack::new();
        assert_eq!(s.pop(), None);
        assert!(s.is_empty());
    }

    #[test]
    fn drops_remaining_values() {
        use std::sync::atomic::{AtomicUsize, Ordering as O};
        struct Counted<'a>(&'a AtomicUsize);
        impl Drop for Counted<'_> {
            fn drop(&mut self) {
                self.0.fetch_add(1, O::SeqCst);
            }
        }
        let counter = AtomicUsize::new(0);
        {
            let s = LockFreeStack::new();
            s.push(Counted(&counter));
            s.push(Counted(&counter));
        }
        assert_eq!(counter.load(O::SeqCst), 2);
    }

    #[test]
    fn concurrent_push_pop_preserves_multiset() {
        let stack = Arc::new(LockFreeStack::new());
        let n_threads = 8;
        let per_thread = 2000;

        let producers: Vec<_> = (0..n_threads)
            .map(|t| {
                let stack = Arc::clone(&stack);
                thread::spawn(move || {
                    for i in 0..per_thread {
                        stack.push(t * per_thread + i);
                    }
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }

        let mut seen = Vec::with_capacity(n_threads * per_thread);
        while let Some(v) = stack.pop() {
            seen.push(v);
        }
        seen.sort_unstable();
        let expected: Vec<_> = (0..n_threads * per_thread).collect();
        assert_eq!(seen, expected);
        assert!(stack.is_empty());
    }
}
