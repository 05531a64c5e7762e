//! Lightweight per-instance read-copy-update.
//!
//! An [`Rcu`] holds two epochs, each a reader counter plus a list of
//! deferred callbacks, and a word naming the current one. Readers enter the
//! current epoch, writers defer cleanup work into it, and the instance
//! rotates between the two epochs as they drain: work deferred while epoch
//! `E` was current runs only after every reader of `E` has exited and the
//! rotation has moved past it. Reclamation is opportunistic — the last
//! reader out of a vacated non-current epoch executes its deferred list —
//! so no external collector is involved.
//!
//! For the shared, thread-registered variant of the same contract see
//! [`grcu`](crate::mem::grcu).

use std::ptr;
use std::sync::atomic::Ordering::{Acquire, SeqCst};
use std::sync::atomic::{fence, AtomicUsize};

use crate::mem::CachePadded;
use crate::sync::list::{List, ListNode};

pub(crate) type DeferFn = Box<dyn FnOnce() + Send>;

/// The seam shared by [`Rcu`] and [`GlobalRcu`](crate::mem::grcu::GlobalRcu):
/// enter/exit a read-side critical section and defer cleanup work out of it.
///
/// Every dereference of state reachable from a structure protected by an
/// implementation must happen between `enter` and the matching `exit`.
/// Violations are undefined behavior and are not detected at runtime.
pub trait Smr {
    /// Open a read-side critical section; returns the epoch entered.
    fn enter(&self) -> usize;

    /// Close the critical section opened by the matching `enter`.
    fn exit(&self, epoch: usize);

    /// Run `f` once the epoch that is current right now has been vacated
    /// and rotated past.
    fn defer<F: FnOnce() + Send + 'static>(&self, f: F);
}

/// RAII enter/exit for any [`Smr`] implementation.
#[must_use]
pub struct RcuGuard<'a, S: Smr> {
    smr: &'a S,
    epoch: usize,
}

impl<'a, S: Smr> RcuGuard<'a, S> {
    pub fn new(smr: &'a S) -> RcuGuard<'a, S> {
        let epoch = smr.enter();
        RcuGuard { smr, epoch }
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }
}

impl<S: Smr> Drop for RcuGuard<'_, S> {
    fn drop(&mut self) {
        self.smr.exit(self.epoch);
    }
}

struct Epoch {
    count: CachePadded<AtomicUsize>,
    defer_list: List<DeferFn>,
}

impl Epoch {
    fn new() -> Epoch {
        Epoch {
            count: CachePadded::new(AtomicUsize::new(0)),
            defer_list: List::new(),
        }
    }
}

/// A self-contained two-epoch RCU instance.
pub struct Rcu {
    current: CachePadded<AtomicUsize>,
    epochs: [Epoch; 2],
}

impl Rcu {
    pub fn new() -> Rcu {
        Rcu {
            current: CachePadded::new(AtomicUsize::new(0)),
            epochs: [Epoch::new(), Epoch::new()],
        }
    }

    /// Enter the current epoch; returns it for the matching [`exit`](Rcu::exit).
    pub fn enter(&self) -> usize {
        /* The extra loop guards against the following race:

           1) A reads current = E and gets preempted.
           2) B enters E+1, sees E vacated and rotates to E+2.
           3) A wakes up and increments E's counter.

           A would now be reading under an epoch whose deferred work may
           already be executing. So: never return while entered in an epoch
           that is no longer (equivalent to) current. Backing off is safe
           because until we return, the caller cannot have read anything it
           shouldn't. */
        let mut epoch;
        loop {
            epoch = self.current.load(SeqCst);
            self.epochs[epoch & 1].count.fetch_add(1, SeqCst);

            if (epoch ^ self.current.load(SeqCst)) & 1 == 0 {
                break;
            }
            self.epochs[epoch & 1].count.fetch_sub(1, SeqCst);
        }

        // The only place the instance rotates: move on from a vacated epoch.
        let other = epoch.wrapping_sub(1);
        if self.epochs[other & 1].count.load(SeqCst) == 0
            && self
                .current
                .compare_exchange(epoch, epoch.wrapping_add(1), SeqCst, SeqCst)
                .is_ok()
        {
            log::trace!(target: "quiesce::rcu", "rotated to epoch {}", epoch.wrapping_add(1));
        }

        fence(Acquire);
        epoch
    }

    /// Leave `epoch`. The last reader out of a vacated non-current epoch
    /// executes its deferred work, outside the critical section.
    pub fn exit(&self, epoch: usize) {
        fence(SeqCst);

        let ep = &self.epochs[epoch & 1];
        let count = ep.count.load(SeqCst);
        debug_assert!(count > 0);

        /* Never execute deferred work while in current: the other epoch may
           not be fully vacated, so read-side sections could still hold the
           data.

           The list must be detached before the decrement, otherwise another
           enter could rotate and swap it from under us. The counter can
           also fail to reach zero after we took the list, or reach zero
           without anyone taking the list; both just delay the work until a
           later rotation, which is fine. */
        let mut defer_head = ptr::null_mut();
        if count == 1 && (epoch ^ self.current.load(SeqCst)) & 1 != 0 {
            defer_head = ep.defer_list.take_all();
        }

        ep.count.fetch_sub(1, SeqCst);

        if !defer_head.is_null() {
            run_deferred(defer_head);
        }
    }

    /// Defer `f` into whichever epoch is current at the push.
    ///
    /// A rotation between the read of `current` and the push is benign: the
    /// callback lands in the non-current epoch and simply waits one extra
    /// rotation.
    pub fn defer<F: FnOnce() + Send + 'static>(&self, f: F) {
        let node = Box::into_raw(Box::new(ListNode::new(Box::new(f) as DeferFn)));
        let epoch = self.current.load(SeqCst);
        unsafe { self.epochs[epoch & 1].defer_list.push(node) };
    }
}

impl Default for Rcu {
    fn default() -> Rcu {
        Rcu::new()
    }
}

impl Drop for Rcu {
    fn drop(&mut self) {
        for ep in &self.epochs {
            debug_assert_eq!(ep.count.load(SeqCst), 0);
            run_deferred(ep.defer_list.take_all());
        }
    }
}

impl Smr for Rcu {
    fn enter(&self) -> usize {
        Rcu::enter(self)
    }

    fn exit(&self, epoch: usize) {
        Rcu::exit(self, epoch)
    }

    fn defer<F: FnOnce() + Send + 'static>(&self, f: F) {
        Rcu::defer(self, f)
    }
}

/// Execute and free a detached chain of deferred callbacks.
pub(crate) fn run_deferred(mut node: *mut ListNode<DeferFn>) {
    while !node.is_null() {
        unsafe {
            let next = (*node).next();
            let boxed = Box::from_raw(node);
            (boxed.value)();
            node = next;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering::Relaxed;
    use std::sync::Arc;

    fn counter_fn(counter: &Arc<AtomicUsize>) -> impl FnOnce() + Send + 'static {
        let counter = Arc::clone(counter);
        move || {
            counter.fetch_add(1, Relaxed);
        }
    }

    #[test]
    fn guard_smoke() {
        let rcu = Rcu::new();
        let _guard = RcuGuard::new(&rcu);
    }

    #[test]
    fn deferred_runs_after_rotation() {
        let rcu = Rcu::new();
        let ran = Arc::new(AtomicUsize::new(0));

        rcu.defer(counter_fn(&ran));
        let e0 = rcu.enter();
        rcu.defer(counter_fn(&ran));
        assert_eq!(ran.load(Relaxed), 0);

        // e0's exit vacates the first epoch and releases its work.
        rcu.exit(e0);
        assert_eq!(ran.load(Relaxed), 1);

        let e1 = rcu.enter();
        rcu.exit(e1);
        assert_eq!(ran.load(Relaxed), 2);
    }

    #[test]
    fn deferred_waits_for_pinned_reader() {
        let rcu = Rcu::new();
        let ran = Arc::new(AtomicUsize::new(0));

        let held = rcu.enter();
        rcu.defer(counter_fn(&ran));

        // Another reader cycling through does not release the work while
        // the first reader is still pinned.
        let e = rcu.enter();
        rcu.exit(e);
        assert_eq!(ran.load(Relaxed), 0);

        rcu.exit(held);
        assert_eq!(ran.load(Relaxed), 0);

        let e = rcu.enter();
        rcu.exit(e);
        assert_eq!(ran.load(Relaxed), 1);
    }

    #[test]
    fn drop_runs_leftovers() {
        let ran = Arc::new(AtomicUsize::new(0));
        {
            let rcu = Rcu::new();
            rcu.defer(counter_fn(&ran));
            let e = rcu.enter();
            rcu.defer(counter_fn(&ran));
            rcu.exit(e);
            assert!(ran.load(Relaxed) < 2);
        }
        assert_eq!(ran.load(Relaxed), 2);
    }

    #[test]
    fn nested_enters_share_an_epoch_word() {
        let rcu = Rcu::new();
        let e0 = rcu.enter();
        let e1 = rcu.enter();
        let e2 = rcu.enter();
        // Readers piling in without rotations in between land in the same
        // epoch; rotation needs the other side vacated.
        assert_eq!(e1, e2);
        rcu.exit(e2);
        rcu.exit(e1);
        rcu.exit(e0);
    }

    // Random enter/exit/defer interleavings on one thread: every deferred
    // callback must run exactly once by the time the instance drops.
    #[test]
    fn fuzz_defer_conservation() {
        use rand::Rng;

        let mut rng = rand::thread_rng();
        let ran = Arc::new(AtomicUsize::new(0));
        let mut registered = 0usize;

        {
            let rcu = Rcu::new();
            let mut held = Vec::new();

            for _ in 0..10_000 {
                match rng.gen_range(0..4) {
                    0 => held.push(rcu.enter()),
                    1 => {
                        if let Some(epoch) = held.pop() {
                            rcu.exit(epoch);
                        }
                    }
                    _ => {
                        rcu.defer(counter_fn(&ran));
                        registered += 1;
                    }
                }
            }

            for epoch in held.drain(..) {
                rcu.exit(epoch);
            }
        }

        assert_eq!(ran.load(Relaxed), registered);
    }

    #[test]
    fn parallel_defer_conservation() {
        const THREADS: usize = 8;
        const ITERS: usize = 1_000;

        let counters: Vec<Arc<AtomicUsize>> =
            (0..THREADS).map(|_| Arc::new(AtomicUsize::new(0))).collect();
        {
            let rcu = Rcu::new();
            std::thread::scope(|scope| {
                for counter in &counters {
                    let rcu = &rcu;
                    scope.spawn(move || {
                        for _ in 0..ITERS {
                            let _guard = RcuGuard::new(rcu);
                            rcu.defer(counter_fn(counter));
                        }
                    });
                }
            });
        }

        for counter in &counters {
            assert_eq!(counter.load(Relaxed), ITERS);
        }
    }
}
