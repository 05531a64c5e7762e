//! Lock-free linear-probing hash map with chained resizes.
//!
//! Keys and values are projected onto atomic words through [`Atomize`], and
//! each bucket is a pair of those words. The magic values encode the slot
//! state: `{EMPTY, EMPTY}` never used, `{k, EMPTY}` reserved by an
//! in-flight insert, `{k, v}` live, and a TOMBSTONE key or value for dead
//! slots. Probing is linear over a power-of-two capacity.
//!
//! A resize installs a successor table behind the full one and migrates
//! buckets cooperatively: every mutator that notices the successor moves a
//! batch of buckets before doing its own work, and any thread can finish a
//! bucket another started, so the protocol stays lock-free. A migrating
//! bucket's value is frozen by folding both magic bits into it; frozen
//! slots can still be read, but every write to them fails, which is what
//! pins each key to exactly one authoritative slot at any instant. Old
//! tables are released through the map's [`Rcu`] once fully drained.

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash};
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::SeqCst;

use crate::mem::atom::{Atomize, OutOfMemory};
use crate::mem::rcu::{Rcu, RcuGuard};

const MIN_CAPACITY: usize = 32;

/// Tables past this fraction of live entries grow before inserting.
/// Numerator/denominator of 0.7.
const LOAD_NUM: usize = 7;
const LOAD_DEN: usize = 10;

/// Buckets migrated per helping visit.
const MIGRATE_BATCH: usize = 8;

/// Low bit of a table's `next` word: the table is fully migrated and may be
/// reclaimed.
const DRAINED: usize = 1;

struct Bucket {
    key: AtomicUsize,
    value: AtomicUsize,
}

struct Table {
    capacity: usize,
    /// Successor pointer tagged with [`DRAINED`]. Null while not resizing.
    next: AtomicUsize,
    /// Cooperative migration cursor.
    scan: AtomicUsize,
    buckets: Box<[Bucket]>,
}

impl Table {
    fn alloc<K: Atomize, V: Atomize>(capacity: usize) -> *mut Table {
        debug_assert!(capacity.is_power_of_two());
        let buckets = (0..capacity)
            .map(|_| Bucket {
                key: AtomicUsize::new(K::EMPTY),
                value: AtomicUsize::new(V::EMPTY),
            })
            .collect();
        Box::into_raw(Box::new(Table {
            capacity,
            next: AtomicUsize::new(0),
            scan: AtomicUsize::new(0),
            buckets,
        }))
    }

    fn next_word(&self) -> usize {
        self.next.load(SeqCst)
    }

    fn is_resizing(&self) -> bool {
        self.next_word() != 0
    }

    fn is_drained(&self) -> bool {
        self.next_word() & DRAINED != 0
    }

    fn successor(&self) -> *mut Table {
        (self.next_word() & !DRAINED) as *mut Table
    }

    /// First successor that is not itself fully migrated. The chain always
    /// ends in a live table, since the newest one has no successor.
    fn live_successor(&self) -> *mut Table {
        let mut t = self.successor();
        unsafe {
            while !t.is_null() && (*t).is_drained() {
                t = (*t).successor();
            }
        }
        t
    }

    fn slot(&self, hash: usize, i: usize) -> usize {
        (hash.wrapping_add(i)) & (self.capacity - 1)
    }
}

// Hands a retired table to a deferred closure.
struct Retired(*mut Table);
unsafe impl Send for Retired {}

fn locked<V: Atomize>(atom: usize) -> bool {
    let mask = V::EMPTY | V::TOMBSTONE;
    atom & mask == mask
}

fn unlock<V: Atomize>(atom: usize) -> usize {
    atom & !(V::EMPTY | V::TOMBSTONE)
}

/// Lock-free hash map.
///
/// All operations are safe for any number of concurrent callers and remain
/// so across resizes. Operations are linearizable per key.
pub struct Map<K, V, S = RandomState>
where
    K: Atomize + Hash + Eq + 'static,
    V: Atomize + 'static,
    S: BuildHasher,
{
    hash_builder: S,
    rcu: Rcu,
    len: AtomicUsize,
    table: AtomicUsize, // *mut Table, never null
    _marker: std::marker::PhantomData<(K, V)>,
}

unsafe impl<K, V, S> Send for Map<K, V, S>
where
    K: Atomize + Hash + Eq + Send + 'static,
    V: Atomize + Send + 'static,
    S: BuildHasher + Send,
{
}

unsafe impl<K, V, S> Sync for Map<K, V, S>
where
    K: Atomize + Hash + Eq + Send + Sync + 'static,
    V: Atomize + Send + Sync + 'static,
    S: BuildHasher + Sync,
{
}

impl<K, V> Map<K, V, RandomState>
where
    K: Atomize + Hash + Eq + 'static,
    V: Atomize + 'static,
{
    pub fn new() -> Map<K, V> {
        Map::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Map<K, V> {
        Map::with_capacity_and_hasher(capacity, RandomState::new())
    }
}

impl<K, V> Default for Map<K, V, RandomState>
where
    K: Atomize + Hash + Eq + 'static,
    V: Atomize + 'static,
{
    fn default() -> Map<K, V> {
        Map::new()
    }
}

impl<K, V, S> Map<K, V, S>
where
    K: Atomize + Hash + Eq + 'static,
    V: Atomize + 'static,
    S: BuildHasher,
{
    pub fn with_capacity_and_hasher(capacity: usize, hash_builder: S) -> Map<K, V, S> {
        Map {
            hash_builder,
            rcu: Rcu::new(),
            len: AtomicUsize::new(0),
            table: AtomicUsize::new(Table::alloc::<K, V>(adjust_capacity(capacity)) as usize),
            _marker: std::marker::PhantomData,
        }
    }

    /// Live entries. Approximate while mutators are in flight.
    pub fn len(&self) -> usize {
        self.len.load(SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Capacity of the newest table.
    pub fn capacity(&self) -> usize {
        let _guard = RcuGuard::new(&self.rcu);
        unsafe { (*self.newest()).capacity }
    }

    /// Grow to at least `capacity` buckets, migrating eagerly.
    pub fn resize(&self, capacity: usize) {
        let _guard = RcuGuard::new(&self.rcu);
        self.resize_impl(adjust_capacity(capacity));
    }

    /// Look up `key`, returning a copy of its value.
    pub fn find(&self, key: &K) -> Option<V> {
        let _guard = RcuGuard::new(&self.rcu);
        let hash = self.hash(key);
        unsafe { self.find_impl(self.root(), hash, key) }
    }

    /// Insert `(key, value)`; `Ok(false)` means the key was already live.
    pub fn insert(&self, key: K, value: V) -> Result<bool, OutOfMemory> {
        let _guard = RcuGuard::new(&self.rcu);
        let hash = self.hash(&key);

        // Grow ahead of the load-factor ceiling so probes stay short.
        unsafe {
            let capacity = (*self.newest()).capacity;
            if (self.len.load(SeqCst) + 1) * LOAD_DEN > capacity * LOAD_NUM {
                self.resize_impl(capacity * 2);
            }
        }

        let key_atom = K::alloc(&key)?;
        let value_atom = match V::alloc(&value) {
            Ok(atom) => atom,
            Err(oom) => {
                unsafe { K::dealloc(key_atom) };
                return Err(oom);
            }
        };

        let inserted = unsafe { self.insert_impl(self.root(), hash, &key, key_atom, value_atom, true) };
        if inserted {
            self.len.fetch_add(1, SeqCst);
        }
        Ok(inserted)
    }

    /// CAS `key`'s value from `*expected` to `desired`.
    ///
    /// On a value mismatch the current value is written back into
    /// `*expected` and the result is `Ok(false)`. A missing key is also
    /// `Ok(false)`, with `*expected` untouched.
    pub fn compare_exchange(&self, key: &K, expected: &mut V, desired: V) -> Result<bool, OutOfMemory> {
        let _guard = RcuGuard::new(&self.rcu);
        let hash = self.hash(key);
        let desired_atom = V::alloc(&desired)?;
        Ok(unsafe { self.compare_exchange_impl(hash, key, expected, desired_atom) })
    }

    /// Remove `key`, returning the value it held.
    pub fn remove(&self, key: &K) -> Option<V> {
        let _guard = RcuGuard::new(&self.rcu);
        let hash = self.hash(key);
        unsafe { self.remove_impl(hash, key) }
    }

    fn hash(&self, key: &K) -> usize {
        self.hash_builder.hash_one(key) as usize
    }

    fn root(&self) -> *mut Table {
        self.table.load(SeqCst) as *mut Table
    }

    fn newest(&self) -> *mut Table {
        let mut t = self.root();
        unsafe {
            while !(*t).successor().is_null() {
                t = (*t).successor();
            }
        }
        t
    }

    /// Ensure a table of at least `capacity` exists, then drain everything
    /// older. Returns the newest table.
    fn resize_impl(&self, capacity: usize) -> *mut Table {
        let mut fresh: *mut Table = std::ptr::null_mut();

        let (old, new) = loop {
            let old = self.newest();
            if unsafe { (*old).capacity } >= capacity {
                if !fresh.is_null() {
                    drop(unsafe { Box::from_raw(fresh) });
                }
                return old;
            }

            if fresh.is_null() {
                fresh = Table::alloc::<K, V>(capacity);
            }

            // Lose the install race, use the winner.
            if unsafe { (*old).next.compare_exchange(0, fresh as usize, SeqCst, SeqCst) }.is_ok() {
                break (old, fresh);
            }
        };

        log::debug!(
            target: "quiesce::map",
            "installed table: capacity {} -> {}",
            unsafe { (*old).capacity },
            capacity,
        );

        unsafe { self.drain(old) };
        new
    }

    /// Migrate every bucket of `t`, then run the finish protocol.
    unsafe fn drain(&self, t: *mut Table) {
        let table = &*t;
        for index in 0..table.capacity {
            self.move_bucket(table, index);
        }
        self.try_finish(t);
    }

    /// Called by mutators that found `t` resizing: advance the shared
    /// cursor by one batch so the resize finishes even if its initiator
    /// stalls.
    unsafe fn help_resize(&self, t: *mut Table) {
        let table = &*t;
        let start = table.scan.fetch_add(MIGRATE_BATCH, SeqCst);
        if start >= table.capacity {
            self.try_finish(t);
            return;
        }

        let end = (start + MIGRATE_BATCH).min(table.capacity);
        for index in start..end {
            self.move_bucket(table, index);
        }
        if end == table.capacity {
            self.try_finish(t);
        }
    }

    /// Move one bucket into the successor table. Any thread may run this on
    /// any bucket at any point of the migration; the bucket is terminal
    /// (key tombstoned) when it returns.
    unsafe fn move_bucket(&self, table: &Table, index: usize) {
        let dest = table.successor();
        debug_assert!(!dest.is_null());
        let bucket = &table.buckets[index];

        // Freeze the value. A reservation is killed instead of frozen (its
        // insert retries downstream), and a tombstone has nothing to move.
        let payload = loop {
            let v = bucket.value.load(SeqCst);
            if v == V::EMPTY {
                if bucket.value.compare_exchange(V::EMPTY, V::TOMBSTONE, SeqCst, SeqCst).is_ok() {
                    break None;
                }
            } else if v == V::TOMBSTONE {
                break None;
            } else if locked::<V>(v) {
                break Some(unlock::<V>(v));
            } else if bucket.value.compare_exchange(v, v | V::EMPTY | V::TOMBSTONE, SeqCst, SeqCst).is_ok() {
                break Some(v);
            }
        };

        if let Some(value_atom) = payload {
            // A tombstoned key here means a racing mover already finished
            // the whole bucket; otherwise the key is pinned while its value
            // is frozen.
            let key_atom = bucket.key.load(SeqCst);
            if key_atom != K::TOMBSTONE {
                debug_assert_ne!(key_atom, K::EMPTY);

                // Re-insert downstream with the original atoms. A racing
                // mover may already have put them there; that duplicate
                // failure is silent and must not release anything.
                let key = K::load(key_atom);
                let hash = self.hash(&key);
                self.insert_impl(dest, hash, &key, key_atom, value_atom, false);

                let _ = bucket.value.compare_exchange(
                    value_atom | V::EMPTY | V::TOMBSTONE,
                    V::TOMBSTONE,
                    SeqCst,
                    SeqCst,
                );
            }
        }

        // Tombstone the key no matter what it is by now; this is the
        // absorbing state the finish protocol verifies.
        loop {
            let k = bucket.key.load(SeqCst);
            if k == K::TOMBSTONE || bucket.key.compare_exchange(k, K::TOMBSTONE, SeqCst, SeqCst).is_ok() {
                break;
            }
        }
    }

    /// If every bucket of `t` is terminal, mark it drained and swing the
    /// root past whatever is drained at the front of the chain.
    unsafe fn try_finish(&self, t: *mut Table) {
        let table = &*t;
        let next = table.next_word();
        if next == 0 || next & DRAINED != 0 {
            return;
        }

        for bucket in table.buckets.iter() {
            if bucket.key.load(SeqCst) != K::TOMBSTONE {
                return;
            }
        }

        if table.next.compare_exchange(next, next | DRAINED, SeqCst, SeqCst).is_err() {
            return;
        }

        log::debug!(target: "quiesce::map", "drained table of capacity {}", table.capacity);
        self.advance_root();
    }

    /// Move the root pointer past drained tables, retiring each table it
    /// steps over.
    ///
    /// Retirement happens only here: a drained table stays allocated while
    /// it is still reachable through a predecessor's next pointer, and the
    /// root advances in chain order, so by the time a table is handed to
    /// the rcu no new reader can reach it.
    fn advance_root(&self) {
        loop {
            let root = self.root();
            let next = unsafe { (*root).next_word() };
            if next & DRAINED == 0 {
                return;
            }
            let successor = next & !DRAINED;
            if self.table.compare_exchange(root as usize, successor, SeqCst, SeqCst).is_ok() {
                // One winner per popped table; readers that saw the old
                // root are covered by the grace period.
                let retired = Retired(root);
                self.rcu.defer(move || unsafe {
                    let retired = retired;
                    drop(Box::from_raw(retired.0));
                });
            }
        }
    }

    unsafe fn find_impl(&self, start: *mut Table, hash: usize, key: &K) -> Option<V> {
        let mut t = start;
        while !t.is_null() {
            let table = &*t;

            for i in 0..table.capacity {
                let bucket = &table.buckets[table.slot(hash, i)];

                let k = bucket.key.load(SeqCst);
                if k == K::EMPTY {
                    break; // not in this table
                }
                if k == K::TOMBSTONE || !K::matches(k, key) {
                    continue;
                }

                let v = bucket.value.load(SeqCst);
                if v == V::EMPTY {
                    break; // reserved but not yet published
                }
                if v == V::TOMBSTONE {
                    continue; // removed; a newer slot may follow
                }
                if locked::<V>(v) {
                    // Mid-migration. The successor is authoritative once
                    // the copy lands there; otherwise the frozen payload
                    // still is.
                    let successor = table.live_successor();
                    if !successor.is_null() {
                        if let Some(found) = self.find_impl(successor, hash, key) {
                            return Some(found);
                        }
                    }
                    return Some(V::load(unlock::<V>(v)));
                }
                return Some(V::load(v));
            }

            t = table.live_successor();
        }
        None
    }

    unsafe fn insert_impl(
        &self,
        start: *mut Table,
        hash: usize,
        key: &K,
        key_atom: usize,
        value_atom: usize,
        dealloc_on_duplicate: bool,
    ) -> bool {
        let mut t = start;
        'table: loop {
            let table = &*t;
            let resizing = table.is_resizing();
            if resizing {
                self.help_resize(t);
            }

            for i in 0..table.capacity {
                let bucket = &table.buckets[table.slot(hash, i)];

                let mut k = bucket.key.load(SeqCst);
                if k == K::EMPTY {
                    if resizing {
                        // Never claim in a dying table: check the successor
                        // for a duplicate instead.
                        t = table.live_successor();
                        continue 'table;
                    }
                    match bucket.key.compare_exchange(K::EMPTY, key_atom, SeqCst, SeqCst) {
                        Ok(_) => {
                            if bucket.value.compare_exchange(V::EMPTY, value_atom, SeqCst, SeqCst).is_ok() {
                                return true;
                            }
                            // A migration killed our reservation between
                            // the two CASes. The atoms are still ours;
                            // retry in the successor.
                            t = table.live_successor();
                            continue 'table;
                        }
                        Err(current) => k = current,
                    }
                }

                if k == K::TOMBSTONE {
                    continue;
                }
                if K::matches(k, key) {
                    let v = bucket.value.load(SeqCst);
                    if v == V::TOMBSTONE {
                        continue; // dead slot, the key may live further on
                    }
                    // Reserved, live or frozen: the key is claimed.
                    if dealloc_on_duplicate {
                        self.defer_dealloc::<K>(key_atom);
                        self.defer_dealloc::<V>(value_atom);
                    }
                    return false;
                }
            }

            // Fully probed with no free slot and no duplicate.
            t = if resizing {
                table.live_successor()
            } else {
                self.resize_impl(table.capacity * 2)
            };
        }
    }

    unsafe fn remove_impl(&self, hash: usize, key: &K) -> Option<V> {
        'restart: loop {
            let mut t = self.root();
            while !t.is_null() {
                let table = &*t;
                if table.is_resizing() {
                    self.help_resize(t);
                }

                for i in 0..table.capacity {
                    let index = table.slot(hash, i);
                    let bucket = &table.buckets[index];

                    let k = bucket.key.load(SeqCst);
                    if k == K::EMPTY {
                        break;
                    }
                    if k == K::TOMBSTONE || !K::matches(k, key) {
                        continue;
                    }

                    loop {
                        let v = bucket.value.load(SeqCst);
                        if v == V::EMPTY {
                            return None; // reserved, never published
                        }
                        if v == V::TOMBSTONE {
                            break; // already removed here; probe on
                        }
                        if locked::<V>(v) {
                            // Bucket is migrating: finish the move and take
                            // it from the top.
                            self.move_bucket(table, index);
                            continue 'restart;
                        }
                        if bucket.value.compare_exchange(v, V::TOMBSTONE, SeqCst, SeqCst).is_ok() {
                            let out = V::load(v);
                            let _ = bucket.key.compare_exchange(k, K::TOMBSTONE, SeqCst, SeqCst);
                            self.len.fetch_sub(1, SeqCst);
                            self.defer_dealloc::<K>(k);
                            self.defer_dealloc::<V>(v);
                            // Our tombstone may have been the last one a
                            // migration was waiting on.
                            if table.is_resizing() {
                                self.try_finish(t);
                            }
                            return Some(out);
                        }
                    }
                }

                t = table.live_successor();
            }
            return None;
        }
    }

    unsafe fn compare_exchange_impl(
        &self,
        hash: usize,
        key: &K,
        expected: &mut V,
        desired_atom: usize,
    ) -> bool {
        'restart: loop {
            let mut t = self.root();
            while !t.is_null() {
                let table = &*t;
                if table.is_resizing() {
                    self.help_resize(t);
                }

                for i in 0..table.capacity {
                    let index = table.slot(hash, i);
                    let bucket = &table.buckets[index];

                    let k = bucket.key.load(SeqCst);
                    if k == K::EMPTY {
                        break;
                    }
                    if k == K::TOMBSTONE || !K::matches(k, key) {
                        continue;
                    }

                    loop {
                        let v = bucket.value.load(SeqCst);
                        if v == V::EMPTY {
                            self.defer_dealloc::<V>(desired_atom);
                            return false;
                        }
                        if v == V::TOMBSTONE {
                            break;
                        }
                        if locked::<V>(v) {
                            self.move_bucket(table, index);
                            continue 'restart;
                        }
                        if !V::matches(v, expected) {
                            *expected = V::load(v);
                            self.defer_dealloc::<V>(desired_atom);
                            return false;
                        }
                        if bucket.value.compare_exchange(v, desired_atom, SeqCst, SeqCst).is_ok() {
                            self.defer_dealloc::<V>(v);
                            return true;
                        }
                    }
                }

                t = table.live_successor();
            }

            self.defer_dealloc::<V>(desired_atom);
            return false;
        }
    }

    fn defer_dealloc<A: Atomize + 'static>(&self, atom: usize) {
        if !A::EMBEDDED {
            self.rcu.defer(move || unsafe { A::dealloc(atom) });
        }
    }
}

fn adjust_capacity(requested: usize) -> usize {
    let mut capacity = MIN_CAPACITY;
    while capacity < requested {
        capacity *= 2;
    }
    capacity
}

impl<K, V, S> Drop for Map<K, V, S>
where
    K: Atomize + Hash + Eq + 'static,
    V: Atomize + 'static,
    S: BuildHasher,
{
    fn drop(&mut self) {
        unsafe {
            // Detach the whole chain and free every table in it, drained or
            // not. A mid-chain table can finish draining before the root
            // catches up to retire it, so the drained flag alone does not
            // mean an rcu release was ever queued. Tables the root already
            // stepped past were handed to the rcu at that point and are no
            // longer part of this chain.
            let mut t = self.table.swap(0, SeqCst) as *mut Table;
            while !t.is_null() {
                let table = &*t;
                let successor = table.successor();

                for bucket in table.buckets.iter() {
                    let k = bucket.key.load(SeqCst);
                    if k != K::EMPTY && k != K::TOMBSTONE {
                        K::dealloc(k);
                    }
                    let v = bucket.value.load(SeqCst);
                    if v != V::EMPTY && v != V::TOMBSTONE {
                        debug_assert!(!locked::<V>(v), "map dropped mid-migration");
                        V::dealloc(v);
                    }
                }
                drop(Box::from_raw(t));
                t = successor;
            }
        }
        // The embedded rcu drops afterwards, releasing tables retired
        // before the drop and deferred atom deallocations.
    }
}
