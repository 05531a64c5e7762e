//! Unbounded lock-free FIFO queue.
//!
//! A Michael-Scott queue whose secret sauce is the sentinel node that head
//! always points to: the queue never has to update both ends when it goes
//! from empty to non-empty or back. When head and tail point at the same
//! node the queue is empty. Popping moves head forward, which turns the
//! next node into the new sentinel after its value is copied out.
//!
//! Pushing is still a two-step process — link the new node, then swing the
//! tail — but the tail swing can be completed by any thread once the link
//! is visible, so a stalled pusher never blocks anyone.
//!
//! Node reclamation is handled by the queue's own [`Rcu`]: a popped
//! sentinel is freed only after every thread that could have snapshotted it
//! has left its read-side section. That same discipline makes the head and
//! tail CAS loops ABA-free, since a node's address cannot be reused while
//! any reader may still hold it.

use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::AtomicPtr;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};

use crate::mem::rcu::{Rcu, RcuGuard};
use crate::mem::CachePadded;

struct Node<T> {
    value: MaybeUninit<T>,
    next: AtomicPtr<Node<T>>,
}

impl<T> Node<T> {
    fn sentinel() -> *mut Node<T> {
        Box::into_raw(Box::new(Node {
            value: MaybeUninit::uninit(),
            next: AtomicPtr::new(ptr::null_mut()),
        }))
    }

    fn new(value: T) -> *mut Node<T> {
        Box::into_raw(Box::new(Node {
            value: MaybeUninit::new(value),
            next: AtomicPtr::new(ptr::null_mut()),
        }))
    }
}

// Frees a raw node from a deferred closure.
struct Reclaim<T>(*mut Node<T>);
unsafe impl<T> Send for Reclaim<T> {}

/// Unbounded multi-producer multi-consumer FIFO queue.
pub struct Queue<T> {
    head: CachePadded<AtomicPtr<Node<T>>>,
    tail: CachePadded<AtomicPtr<Node<T>>>,
    rcu: Rcu,
}

unsafe impl<T: Send> Send for Queue<T> {}
unsafe impl<T: Send> Sync for Queue<T> {}

impl<T: Send + 'static> Queue<T> {
    pub fn new() -> Queue<T> {
        let sentinel = Node::sentinel();
        Queue {
            head: CachePadded::new(AtomicPtr::new(sentinel)),
            tail: CachePadded::new(AtomicPtr::new(sentinel)),
            rcu: Rcu::new(),
        }
    }

    /// Add `value` to the back of the queue.
    pub fn push(&self, value: T) {
        let _guard = RcuGuard::new(&self.rcu);
        let node = Node::new(value);

        loop {
            // The sentinel guarantees tail is never null.
            let tail = self.tail.load(Acquire);
            let next = unsafe { (*tail).next.load(Acquire) };

            // Avoids spinning a CAS on a stale snapshot under contention.
            if self.tail.load(Relaxed) != tail {
                continue;
            }

            if next.is_null() {
                if unsafe { (*tail).next.compare_exchange(ptr::null_mut(), node, Release, Relaxed) }
                    .is_err()
                {
                    continue;
                }
                // Losing this swing means someone else already helped.
                let _ = self.tail.compare_exchange(tail, node, Release, Relaxed);
                return;
            }

            // Someone beat us to the link; help the tail along first.
            let _ = self.tail.compare_exchange(tail, next, Release, Relaxed);
        }
    }

    /// Remove and return the front value, or `None` when the queue is
    /// observed empty.
    pub fn try_pop(&self) -> Option<T> {
        let guard = RcuGuard::new(&self.rcu);

        loop {
            let head = self.head.load(Acquire);
            // Tail must be read before head's next: that order guarantees
            // that head != tail implies a non-null next.
            let tail = self.tail.load(Acquire);
            let next = unsafe { (*head).next.load(Acquire) };

            if self.head.load(Relaxed) != head {
                continue;
            }

            if head == tail {
                if next.is_null() {
                    return None;
                }
                // Tail is lagging; help it forward and retry.
                let _ = self.tail.compare_exchange(tail, next, Release, Relaxed);
                continue;
            }

            debug_assert!(!next.is_null());
            if self.head.compare_exchange(head, next, Release, Relaxed).is_err() {
                continue;
            }

            // `next` is the new sentinel: copy its value out and retire the
            // old sentinel once every reader is gone.
            let value = unsafe { ptr::read((*next).value.as_ptr()) };
            let retired = Reclaim(head);
            self.rcu.defer(move || unsafe {
                let retired = retired;
                drop(Box::from_raw(retired.0));
            });

            drop(guard);
            return Some(value);
        }
    }
}

impl<T: Copy + Send + 'static> Queue<T> {
    /// Copy the front value without removing it.
    ///
    /// Only offered for `Copy` types: a concurrent pop hands the same value
    /// to its caller, and a bit copy is the one duplication that is always
    /// benign.
    pub fn peek(&self) -> Option<T> {
        let _guard = RcuGuard::new(&self.rcu);

        loop {
            let head = self.head.load(Acquire);
            let tail = self.tail.load(Acquire);
            let next = unsafe { (*head).next.load(Acquire) };

            if self.head.load(Relaxed) != head {
                continue;
            }

            if head == tail {
                if next.is_null() {
                    return None;
                }
                let _ = self.tail.compare_exchange(tail, next, Release, Relaxed);
                continue;
            }

            return Some(unsafe { *(*next).value.as_ptr() });
        }
    }
}

impl<T: Send + 'static> Default for Queue<T> {
    fn default() -> Queue<T> {
        Queue::new()
    }
}

impl<T> Drop for Queue<T> {
    fn drop(&mut self) {
        // The head node is the sentinel: its value is stale. Everything
        // after it is live and must be dropped.
        unsafe {
            let mut node = self.head.load(Relaxed);
            let mut first = true;
            while !node.is_null() {
                let mut boxed = Box::from_raw(node);
                if !first {
                    boxed.value.assume_init_drop();
                }
                first = false;
                node = boxed.next.load(Relaxed);
            }
        }
        // The embedded rcu drops after this, freeing retired sentinels.
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering::Relaxed;

    const CONC_COUNT: i64 = 100_000;

    #[test]
    fn push_pop_1() {
        let q: Queue<i64> = Queue::new();
        q.push(37);
        assert_eq!(q.try_pop(), Some(37));
        assert_eq!(q.try_pop(), None);
    }

    #[test]
    fn push_pop_2() {
        let q: Queue<i64> = Queue::new();
        q.push(37);
        q.push(48);
        assert_eq!(q.try_pop(), Some(37));
        assert_eq!(q.try_pop(), Some(48));
        assert_eq!(q.try_pop(), None);
    }

    #[test]
    fn push_peek_pop() {
        let q: Queue<i64> = Queue::new();
        assert_eq!(q.peek(), None);
        q.push(3);
        q.push(4);
        assert_eq!(q.peek(), Some(3));
        assert_eq!(q.peek(), Some(3));
        assert_eq!(q.try_pop(), Some(3));
        assert_eq!(q.peek(), Some(4));
    }

    #[test]
    fn push_pop_many_seq() {
        let q: Queue<i64> = Queue::new();
        for i in 0..200 {
            q.push(i);
        }
        for i in 0..200 {
            assert_eq!(q.try_pop(), Some(i));
        }
        assert_eq!(q.try_pop(), None);
    }

    #[test]
    fn drop_releases_values() {
        static DROPS: AtomicUsize = AtomicUsize::new(0);
        struct Counted;
        impl Drop for Counted {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Relaxed);
            }
        }

        {
            let q: Queue<Counted> = Queue::new();
            for _ in 0..10 {
                q.push(Counted);
            }
            drop(q.try_pop());
            drop(q.try_pop());
        }
        assert_eq!(DROPS.load(Relaxed), 10);
    }

    #[test]
    fn push_pop_many_spsc() {
        let q: Queue<i64> = Queue::new();

        std::thread::scope(|scope| {
            scope.spawn(|| {
                let mut next = 0;
                while next < CONC_COUNT {
                    if let Some(elem) = q.try_pop() {
                        assert_eq!(elem, next);
                        next += 1;
                    }
                }
            });

            for i in 0..CONC_COUNT {
                q.push(i);
            }
        });
        assert_eq!(q.try_pop(), None);
    }

    // Four tagged producers, four consumers; per-producer order must
    // survive and the union of pops must equal the union of pushes.
    #[test]
    fn push_pop_many_mpmc() {
        const PRODUCERS: usize = 4;
        const CONSUMERS: usize = 4;
        const PER_PRODUCER: u64 = 10_000;
        const TOTAL: u64 = PRODUCERS as u64 * PER_PRODUCER;

        let q: Queue<(usize, u64)> = Queue::new();
        let popped = AtomicUsize::new(0);
        let buckets: Vec<std::sync::Mutex<Vec<(usize, u64)>>> =
            (0..CONSUMERS).map(|_| std::sync::Mutex::new(Vec::new())).collect();

        std::thread::scope(|scope| {
            for id in 0..PRODUCERS {
                let q = &q;
                scope.spawn(move || {
                    for i in 0..PER_PRODUCER {
                        q.push((id, i));
                    }
                });
            }

            for bucket in &buckets {
                let q = &q;
                let popped = &popped;
                scope.spawn(move || {
                    let mut local = Vec::new();
                    while (popped.load(Relaxed) as u64) < TOTAL {
                        if let Some(pair) = q.try_pop() {
                            popped.fetch_add(1, Relaxed);
                            local.push(pair);
                        }
                    }
                    bucket.lock().unwrap().extend(local);
                });
            }
        });

        // Per-consumer streams are ascending per producer.
        for bucket in &buckets {
            let mut last = [None::<u64>; PRODUCERS];
            for &(id, i) in bucket.lock().unwrap().iter() {
                if let Some(prev) = last[id] {
                    assert!(i > prev);
                }
                last[id] = Some(i);
            }
        }

        // Conservation: no losses, no duplicates.
        let mut all: Vec<(usize, u64)> = buckets
            .iter()
            .flat_map(|b| b.lock().unwrap().clone())
            .collect();
        assert_eq!(all.len() as u64, TOTAL);
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len() as u64, TOTAL);
        assert_eq!(q.try_pop(), None);
    }
}
