//! Scalable non-zero indicator.
//!
//! A tree of counters that answers one question — is the count nonzero? —
//! without funneling every increment through a single cache line. Threads
//! hash onto a tree slot by id; a leaf going from zero to nonzero announces
//! itself upward, so the root is nonzero exactly while some subtree is.
//!
//! Non-root counters run a three-state machine: 0 is idle, 1 is announcing
//! (the upward increment is in flight), and `n + 1` represents `n` settled
//! holders. An announcer that loses the settling CAS takes its parent
//! increment back; parent increments are otherwise monotonic until matched
//! by a dec.
//!
//! Worth its salt only when a plain fetch-add on one word is the
//! bottleneck; the root alone, which uses exactly that, is the degenerate
//! configuration.

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::SeqCst;

use crate::mem::CachePadded;
use crate::tls::thread_id;

/// Contention-dispersing non-zero indicator over `NODES` counters arranged
/// as an `ARITY`-ary tree rooted at index 0.
pub struct Snzi<const NODES: usize, const ARITY: usize = 2> {
    tree: [CachePadded<AtomicUsize>; NODES],
}

impl<const NODES: usize, const ARITY: usize> Snzi<NODES, ARITY> {
    pub fn new() -> Snzi<NODES, ARITY> {
        const {
            assert!(NODES > 0);
            assert!(ARITY > 1);
        }
        Snzi { tree: std::array::from_fn(|_| CachePadded::new(AtomicUsize::new(0))) }
    }

    /// True while increments outnumber decrements.
    pub fn test(&self) -> bool {
        self.tree[0].load(SeqCst) != 0
    }

    /// Register one holder; true if the indicator flipped from zero.
    pub fn inc(&self) -> bool {
        self.inc_node(self.node_for_thread())
    }

    /// Drop one holder; true if the indicator flipped to zero.
    ///
    /// Must pair with an earlier [`inc`](Snzi::inc) from the same thread.
    pub fn dec(&self) -> bool {
        self.dec_node(self.node_for_thread())
    }

    fn node_for_thread(&self) -> usize {
        thread_id() % NODES
    }

    fn inc_node(&self, node: usize) -> bool {
        if node == 0 {
            return self.tree[0].fetch_add(1, SeqCst) == 0;
        }

        let counter = &self.tree[node];
        let parent = node / ARITY;
        let mut value = counter.load(SeqCst);

        loop {
            if value > 1 {
                match counter.compare_exchange_weak(value, value + 1, SeqCst, SeqCst) {
                    Ok(_) => return false,
                    Err(current) => {
                        value = current;
                        continue;
                    }
                }
            }

            if value == 0 {
                match counter.compare_exchange_weak(0, 1, SeqCst, SeqCst) {
                    Ok(_) => value = 1,
                    Err(current) => {
                        value = current;
                        continue;
                    }
                }
            }

            debug_assert_eq!(value, 1);

            // Announce upward, then settle 1 -> 2 to keep the parent
            // increment. Losing the settle means another announcer beat us;
            // give the increment back and retry.
            let shifted = self.inc_node(parent);

            if counter.compare_exchange(1, 2, SeqCst, SeqCst).is_ok() {
                return shifted;
            }

            self.dec_node(parent);
            value = counter.load(SeqCst);
        }
    }

    fn dec_node(&self, node: usize) -> bool {
        if node == 0 {
            return self.tree[0].fetch_sub(1, SeqCst) == 1;
        }

        let counter = &self.tree[node];
        let parent = node / ARITY;
        let mut value = counter.load(SeqCst);

        loop {
            debug_assert!(value >= 2);

            if value > 2 {
                match counter.compare_exchange_weak(value, value - 1, SeqCst, SeqCst) {
                    Ok(_) => return false,
                    Err(current) => {
                        value = current;
                        continue;
                    }
                }
            }

            // Last holder here: zero the counter and take the parent
            // increment back with us.
            match counter.compare_exchange_weak(2, 0, SeqCst, SeqCst) {
                Ok(_) => return self.dec_node(parent),
                Err(current) => value = current,
            }
        }
    }
}

impl<const NODES: usize, const ARITY: usize> Default for Snzi<NODES, ARITY> {
    fn default() -> Snzi<NODES, ARITY> {
        Snzi::new()
    }
}
