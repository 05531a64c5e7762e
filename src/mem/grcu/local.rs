// Thread registration. Each thread lazily allocates one epoch-pair node,
// links it into the global registry on first use, and unlinks it again when
// the thread dies. Deferred work left behind by a dying thread migrates to
// the gc-dump node so it still runs on a later gc pass.

use std::sync::atomic::Ordering::SeqCst;

use super::global::{self, Epochs};
use crate::mem::rcu::run_deferred;
use crate::sync::list::ListNode;

struct ThreadHandle {
    node: *mut ListNode<Epochs>,
}

impl ThreadHandle {
    fn register() -> ThreadHandle {
        let state = global::get();
        let node = Box::into_raw(Box::new(ListNode::new(Epochs::new())));
        // Registration is lock-free; gc walkers either see the node or
        // catch it on their next pass.
        unsafe { state.threads.push(node) };
        log::trace!(target: "quiesce::grcu", "registered thread node {:p}", node);
        ThreadHandle { node }
    }
}

impl Drop for ThreadHandle {
    fn drop(&mut self) {
        let state = global::get();
        // Also keeps us from racing instance teardown.
        let _guard = state.lock.lock();

        log::trace!(target: "quiesce::grcu", "unregistering thread node {:p}", self.node);

        unsafe {
            let epochs = &(*self.node).value;
            let dump = state.gc_dump.load(SeqCst);

            for i in 0..2 {
                let epoch = &epochs.0[i];
                debug_assert_eq!(epoch.count.load(SeqCst), 0);

                if dump.is_null() {
                    // No live instance, hence no readers: leftover work can
                    // run right here.
                    run_deferred(epoch.defer_list.take_all());
                } else {
                    (*dump).value.0[i].defer_list.take(&epoch.defer_list);
                }
            }

            let removed = state.threads.remove(self.node);
            debug_assert!(removed);
            drop(Box::from_raw(self.node));
        }
    }
}

thread_local! {
    static HANDLE: ThreadHandle = ThreadHandle::register();
}

/// Run `f` against the calling thread's epoch pair, registering it first if
/// needed.
pub(super) fn with_node<R>(f: impl FnOnce(&Epochs) -> R) -> R {
    HANDLE.with(|handle| f(unsafe { &(*handle.node).value }))
}
