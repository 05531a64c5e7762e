//! A minimal spin lock.
//!
//! The only lock in the crate. It serializes global-RCU initialization,
//! teardown and `gc()` passes, none of which sit on a fast path, so a plain
//! test-and-set spin is enough.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::{Acquire, Release};

pub struct SpinLock {
    locked: AtomicBool,
}

impl SpinLock {
    pub const fn new() -> SpinLock {
        SpinLock { locked: AtomicBool::new(false) }
    }

    /// Spin until the lock is acquired.
    pub fn lock(&self) -> SpinGuard<'_> {
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            while self.locked.load(Acquire) {
                std::hint::spin_loop();
            }
        }
    }

    /// Acquire the lock only if it is free right now.
    pub fn try_lock(&self) -> Option<SpinGuard<'_>> {
        if self.locked.compare_exchange(false, true, Acquire, Acquire).is_ok() {
            Some(SpinGuard { lock: self })
        } else {
            None
        }
    }
}

impl Default for SpinLock {
    fn default() -> SpinLock {
        SpinLock::new()
    }
}

pub struct SpinGuard<'a> {
    lock: &'a SpinLock,
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Release);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering::Relaxed;

    #[test]
    fn try_lock_excludes() {
        let lock = SpinLock::new();
        let guard = lock.try_lock().unwrap();
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn counter_stays_consistent() {
        const THREADS: usize = 4;
        const ITERS: usize = 10_000;

        let lock = SpinLock::new();
        let count = AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for _ in 0..THREADS {
                scope.spawn(|| {
                    for _ in 0..ITERS {
                        let _guard = lock.lock();
                        let seen = count.load(Relaxed);
                        count.store(seen + 1, Relaxed);
                    }
                });
            }
        });

        assert_eq!(count.load(Relaxed), THREADS * ITERS);
    }
}
