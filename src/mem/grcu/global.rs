// Process-wide epoch state: the epoch word, the registry of per-thread
// nodes, and the gc-dump node that collects deferred work orphaned by dead
// threads. One spin lock serializes instance init/teardown and gc passes;
// enter/exit/defer never touch it.

use std::sync::atomic::{AtomicPtr, AtomicUsize};
use std::sync::OnceLock;

use crate::mem::rcu::DeferFn;
use crate::sync::list::{List, ListNode};
use crate::sync::lock::SpinLock;

pub(super) struct Epoch {
    pub count: AtomicUsize,
    pub defer_list: List<DeferFn>,
}

impl Epoch {
    fn new() -> Epoch {
        Epoch { count: AtomicUsize::new(0), defer_list: List::new() }
    }
}

/// The value held by each registered thread node: one epoch pair.
pub(super) struct Epochs(pub [Epoch; 2]);

impl Epochs {
    pub fn new() -> Epochs {
        Epochs([Epoch::new(), Epoch::new()])
    }
}

pub(super) struct GlobalState {
    pub lock: SpinLock,

    /// Live `GlobalRcu` handles. Guarded by `lock`.
    pub ref_count: AtomicUsize,

    /// The epoch word; only `gc` advances it.
    pub epoch: AtomicUsize,

    /// Registry of per-thread epoch pairs.
    pub threads: List<Epochs>,

    /// Collects the defer lists of threads that exit with work pending.
    /// Null while no instance is live. Guarded by `lock`.
    pub gc_dump: AtomicPtr<ListNode<Epochs>>,
}

static STATE: OnceLock<GlobalState> = OnceLock::new();

pub(super) fn get() -> &'static GlobalState {
    STATE.get_or_init(|| GlobalState {
        lock: SpinLock::new(),
        ref_count: AtomicUsize::new(0),
        epoch: AtomicUsize::new(1),
        threads: List::new(),
        gc_dump: AtomicPtr::new(std::ptr::null_mut()),
    })
}
