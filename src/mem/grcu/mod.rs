//! Shared read-copy-update with per-thread registration.
//!
//! [`GlobalRcu`] implements the same two-epoch contract as
//! [`Rcu`](crate::mem::rcu::Rcu), but the reader counters live in a
//! registration node private to each thread, so `enter`/`exit` touch no
//! shared cache line and scale with the reader count. The price is that
//! nothing is reclaimed until someone calls [`gc`](GlobalRcu::gc): the only
//! place the shared epoch advances. Run it from your own maintenance loop,
//! or spawn a [`GcThread`] and forget about it; reclamation latency is then
//! bounded by the gc cadence rather than the reader rate.
//!
//! However many `GlobalRcu` handles exist, they all share the same process
//! state under the hood. Dropping the last handle drains both epochs;
//! readers must be quiescent by then.
//!
//! Deferred callbacks execute inside the gc pass while a process-wide lock
//! is held, so they must not construct, drop, or gc a `GlobalRcu` handle
//! themselves.

mod global;
mod local;

use std::io;
use std::sync::atomic::Ordering::{Relaxed, SeqCst};
use std::sync::atomic::{fence, AtomicBool};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use self::global::GlobalState;
use crate::mem::rcu::{run_deferred, DeferFn, Smr};
use crate::sync::list::ListNode;

/// Handle to the process-wide RCU.
pub struct GlobalRcu {
    _priv: (),
}

impl GlobalRcu {
    /// Open a handle, initializing the shared state if this is the first
    /// one live.
    pub fn new() -> GlobalRcu {
        let state = global::get();
        let _guard = state.lock.lock();

        let refs = state.ref_count.load(Relaxed);
        state.ref_count.store(refs + 1, Relaxed);

        if refs == 0 {
            let dump = Box::into_raw(Box::new(ListNode::new(global::Epochs::new())));
            state.gc_dump.store(dump, SeqCst);
            unsafe { state.threads.push(dump) };
            log::debug!(target: "quiesce::grcu", "initialized global rcu");
        }

        GlobalRcu { _priv: () }
    }

    /// Enter the current epoch on the calling thread's node.
    pub fn enter(&self) -> usize {
        let state = global::get();
        let epoch = state.epoch.load(Relaxed);

        local::with_node(|node| {
            let count = &node.0[epoch & 1].count;
            // Owner-only write; gc reads it under the lock.
            count.store(count.load(Relaxed) + 1, Relaxed);
        });

        // Keeps reads from floating above the counter increment.
        fence(SeqCst);
        epoch
    }

    /// Leave `epoch` on the calling thread's node.
    pub fn exit(&self, epoch: usize) {
        // All reads must land before the decrement, and there is no release
        // form for loads, so pay for a full fence.
        fence(SeqCst);

        local::with_node(|node| {
            let count = &node.0[epoch & 1].count;
            let old = count.load(Relaxed);
            debug_assert!(old > 0);
            count.store(old - 1, Relaxed);
        });
    }

    /// Defer `f` onto the calling thread's current-epoch list.
    pub fn defer<F: FnOnce() + Send + 'static>(&self, f: F) {
        let state = global::get();
        let node = Box::into_raw(Box::new(ListNode::new(Box::new(f) as DeferFn)));
        let epoch = state.epoch.load(Relaxed);
        local::with_node(|epochs| unsafe {
            epochs.0[epoch & 1].defer_list.push(node);
        });
    }

    /// Attempt one reclamation pass.
    ///
    /// Returns false when another reclaimer holds the lock, or when some
    /// thread still occupies the non-current epoch. On success, every
    /// registered node's non-current defer list has been executed and the
    /// epoch has advanced.
    pub fn gc(&self) -> bool {
        let state = global::get();
        // One reclaimer at a time; contended callers just report back.
        let Some(_guard) = state.lock.try_lock() else {
            return false;
        };
        gc_locked(state)
    }
}

impl Default for GlobalRcu {
    fn default() -> GlobalRcu {
        GlobalRcu::new()
    }
}

impl Drop for GlobalRcu {
    fn drop(&mut self) {
        let state = global::get();
        let _guard = state.lock.lock();

        let refs = state.ref_count.load(Relaxed);
        state.ref_count.store(refs - 1, Relaxed);
        if refs > 1 {
            return;
        }

        // Last handle out: both epochs must drain, which takes exactly two
        // passes. A reader still pinned here is a caller error.
        let first = gc_locked(state);
        let second = gc_locked(state);
        debug_assert!(first && second, "global rcu torn down with a pinned reader");

        let dump = state.gc_dump.swap(std::ptr::null_mut(), SeqCst);
        unsafe {
            let removed = state.threads.remove(dump);
            debug_assert!(removed);
            for epoch in &(*dump).value.0 {
                run_deferred(epoch.defer_list.take_all());
            }
            drop(Box::from_raw(dump));
        }
        log::debug!(target: "quiesce::grcu", "tore down global rcu");
    }
}

impl Smr for GlobalRcu {
    fn enter(&self) -> usize {
        GlobalRcu::enter(self)
    }

    fn exit(&self, epoch: usize) {
        GlobalRcu::exit(self, epoch)
    }

    fn defer<F: FnOnce() + Send + 'static>(&self, f: F) {
        GlobalRcu::defer(self, f)
    }
}

// The pass itself; caller holds the lock.
fn gc_locked(state: &'static GlobalState) -> bool {
    let parity = state.epoch.load(SeqCst).wrapping_sub(1) & 1;

    // First pass: bail if anyone still occupies the epoch being collected.
    let mut node = state.threads.head();
    debug_assert!(!node.is_null());
    while !node.is_null() {
        unsafe {
            if (*node).value.0[parity].count.load(SeqCst) != 0 {
                return false;
            }
            node = (*node).next();
        }
    }

    // Vacated: execute every node's deferred work for that epoch.
    let mut node = state.threads.head();
    while !node.is_null() {
        unsafe {
            run_deferred((*node).value.0[parity].defer_list.take_all());
            node = (*node).next();
        }
    }

    // All deferred work completes before the epoch moves forward.
    fence(SeqCst);
    let epoch = state.epoch.fetch_add(1, SeqCst) + 1;
    log::debug!(target: "quiesce::grcu", "advanced to epoch {}", epoch);
    true
}

/// Background reclaimer: runs [`GlobalRcu::gc`] on a millisecond cadence
/// until joined. Joins on drop unless detached.
pub struct GcThread {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl GcThread {
    /// Spawn the reclaimer. Thread-spawn failure is handed back to the
    /// caller, like every other resource failure in the crate.
    pub fn new() -> io::Result<GcThread> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);

        let handle = thread::Builder::new()
            .name("quiesce-gc".into())
            .spawn(move || {
                let rcu = GlobalRcu::new();
                while !flag.load(Relaxed) {
                    rcu.gc();
                    thread::sleep(Duration::from_millis(1));
                }
            })?;

        Ok(GcThread { stop, handle: Some(handle) })
    }

    /// Stop the reclaimer and wait for it.
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.stop.store(true, Relaxed);
            let _ = handle.join();
        }
    }

    /// Let the reclaimer run for the rest of the process.
    pub fn detach(mut self) {
        self.handle.take();
    }
}

impl Drop for GcThread {
    fn drop(&mut self) {
        self.join();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mem::rcu::RcuGuard;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering::Relaxed;
    use std::sync::{Mutex, MutexGuard};

    // Every test here shares the process-wide epoch state, so they take
    // turns instead of interleaving.
    fn serial() -> MutexGuard<'static, ()> {
        static LOCK: Mutex<()> = Mutex::new(());
        LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn counter_fn(counter: &Arc<AtomicUsize>) -> impl FnOnce() + Send + 'static {
        let counter = Arc::clone(counter);
        move || {
            counter.fetch_add(1, Relaxed);
        }
    }

    #[test]
    fn guard_smoke() {
        let _serial = serial();
        let rcu = GlobalRcu::new();
        let _guard = RcuGuard::new(&rcu);
    }

    #[test]
    fn epoch_trace() {
        let _serial = serial();
        let rcu = GlobalRcu::new();
        let ran = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            ran.store(0, Relaxed);

            let e0 = rcu.enter();
            rcu.defer(counter_fn(&ran));
            rcu.defer(counter_fn(&ran));
            assert_eq!(rcu.enter(), e0);
            assert_eq!(ran.load(Relaxed), 0);

            rcu.exit(e0);
            assert!(rcu.gc());
            let e1 = rcu.enter();
            assert_ne!(e1, e0);
            assert_eq!(ran.load(Relaxed), 0);

            rcu.defer(counter_fn(&ran));
            rcu.defer(counter_fn(&ran));
            // e0 is still occupied once, so the epoch it pinned can't drain.
            assert!(!rcu.gc());
            assert_eq!(rcu.enter(), e1);
            assert_eq!(ran.load(Relaxed), 0);

            rcu.exit(e0);
            assert!(rcu.gc());
            let e2 = rcu.enter();
            rcu.defer(counter_fn(&ran));
            assert_ne!(e2, e0);
            assert_ne!(e2, e1);
            assert_eq!(ran.load(Relaxed), 2);

            rcu.exit(e2);
            rcu.exit(e1);
            rcu.exit(e1);
            assert!(rcu.gc());
            assert_eq!(ran.load(Relaxed), 4);
            assert!(rcu.gc());
            assert_eq!(ran.load(Relaxed), 5);
        }
    }

    #[test]
    fn defer_runs_after_two_passes() {
        let _serial = serial();
        let rcu = GlobalRcu::new();
        let ran = Arc::new(AtomicUsize::new(0));

        let e0 = rcu.enter();
        rcu.defer(counter_fn(&ran));
        rcu.defer(counter_fn(&ran));
        rcu.exit(e0);
        assert_eq!(ran.load(Relaxed), 0);

        // First pass rotates the work into the collectable epoch, the
        // second executes it.
        assert!(rcu.gc());
        assert!(rcu.gc());
        assert_eq!(ran.load(Relaxed), 2);
    }

    #[test]
    fn drop_drains_leftovers() {
        let _serial = serial();
        let ran = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            ran.store(0, Relaxed);
            {
                let rcu = GlobalRcu::new();
                rcu.defer(counter_fn(&ran));
                rcu.defer(counter_fn(&ran));
                rcu.gc();
                rcu.defer(counter_fn(&ran));
                assert_eq!(ran.load(Relaxed), 0);
            }
            assert_eq!(ran.load(Relaxed), 3);
        }
    }

    #[test]
    fn dead_threads_leave_no_work_behind() {
        let _serial = serial();
        const THREADS: usize = 8;
        const ITERS: usize = 500;

        let counters: Vec<Arc<AtomicUsize>> =
            (0..THREADS).map(|_| Arc::new(AtomicUsize::new(0))).collect();

        {
            let rcu = GlobalRcu::new();
            std::thread::scope(|scope| {
                for counter in &counters {
                    scope.spawn(move || {
                        let rcu = GlobalRcu::new();
                        for _ in 0..ITERS {
                            let guard = RcuGuard::new(&rcu);
                            rcu.defer(counter_fn(counter));
                            drop(guard);
                        }
                    });
                }
                // Churn the collector while workers run and die.
                for _ in 0..1_000 {
                    rcu.gc();
                    std::thread::yield_now();
                }
            });
        }

        for counter in &counters {
            assert_eq!(counter.load(Relaxed), ITERS);
        }
    }

    #[test]
    fn gc_thread_reclaims_unattended() {
        let _serial = serial();
        let rcu = GlobalRcu::new();
        let ran = Arc::new(AtomicUsize::new(0));

        let mut gc = GcThread::new().unwrap();
        rcu.defer(counter_fn(&ran));

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while ran.load(Relaxed) == 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        gc.join();

        assert_eq!(ran.load(Relaxed), 1);
    }
}
