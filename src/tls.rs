//! Small per-thread integer ids.

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::Relaxed;

static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static THREAD_ID: usize = NEXT_ID.fetch_add(1, Relaxed);
}

/// A dense id for the calling thread, assigned on first use.
///
/// Unlike `std::thread::ThreadId` these start at zero and grow by one per
/// thread, which makes them usable as array indices (SNZI leaf selection).
pub fn thread_id() -> usize {
    THREAD_ID.with(|id| *id)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn stable_within_a_thread() {
        assert_eq!(thread_id(), thread_id());
    }

    #[test]
    fn distinct_across_threads() {
        let mine = thread_id();
        let theirs = std::thread::spawn(thread_id).join().unwrap();
        assert_ne!(mine, theirs);
    }
}
