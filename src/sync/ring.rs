//! Fixed-capacity lock-free ring queues.
//!
//! A ring is an array of atomic cells plus a pair of 32-bit cursors. A cell
//! holding zero is vacant, which is why values pass through the [`Slot`]
//! trait: the encoding must never produce the zero word. The push and pop
//! ends come in a single-threaded flavor, where the cursor has one writer
//! and plain stores suffice, and a multi-threaded flavor, where claiming a
//! cell is a CAS and the cursor is advanced cooperatively — a thread that
//! finds it lagging helps it forward instead of waiting. The four
//! combinations of ends are exposed as [`RingSrsw`], [`RingMrmw`],
//! [`RingSrmw`] and [`RingMrsw`], all over the same state.
//!
//! The cursors wrap independently at 32 bits, so `size` and `is_empty` are
//! advisory while the ring is being used concurrently.

use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release, SeqCst};

/// Values storable in a ring cell.
///
/// `into_word` must never return zero for a valid value; zero is the
/// vacancy sentinel. Pushing such a value is a caller error.
pub trait Slot: Copy {
    fn into_word(self) -> usize;
    fn from_word(word: usize) -> Self;
}

macro_rules! slot_uint {
    ($($int:ty),* $(,)*) => {$(
        impl Slot for $int {
            fn into_word(self) -> usize {
                self as usize
            }

            fn from_word(word: usize) -> Self {
                word as $int
            }
        }
    )*};
}

slot_uint!(usize, u32);

#[cfg(target_pointer_width = "64")]
slot_uint!(u64);

impl Slot for std::num::NonZeroUsize {
    fn into_word(self) -> usize {
        self.get()
    }

    fn from_word(word: usize) -> Self {
        debug_assert_ne!(word, 0);
        unsafe { std::num::NonZeroUsize::new_unchecked(word) }
    }
}

// Non-null pointers ride along unchanged.
impl<T> Slot for *mut T {
    fn into_word(self) -> usize {
        self as usize
    }

    fn from_word(word: usize) -> Self {
        word as *mut T
    }
}

/// Cell array and cursor pair shared by every ring variant.
struct RingState<const N: usize> {
    read: AtomicU32,
    write: AtomicU32,
    cells: [AtomicUsize; N],
}

impl<const N: usize> RingState<N> {
    fn new() -> RingState<N> {
        const {
            assert!(N > 0);
            assert!(N < u32::MAX as usize);
        }
        RingState {
            read: AtomicU32::new(0),
            write: AtomicU32::new(0),
            cells: std::array::from_fn(|_| AtomicUsize::new(0)),
        }
    }

    fn size(&self) -> usize {
        let read = self.read.load(Relaxed);
        let write = self.write.load(Relaxed);
        write.wrapping_sub(read) as usize
    }

    fn cell(&self, pos: u32) -> &AtomicUsize {
        &self.cells[pos as usize % N]
    }

    /// Push with exclusive ownership of the write end.
    fn push_single(&self, word: usize) -> bool {
        debug_assert_ne!(word, 0);

        let pos = self.write.load(Relaxed);
        let cell = self.cell(pos);

        if cell.load(Acquire) != 0 {
            return false;
        }
        cell.store(word, Release);
        self.write.store(pos.wrapping_add(1), Release);
        true
    }

    /// Pop with exclusive ownership of the read end.
    fn pop_single(&self) -> Option<usize> {
        let pos = self.read.load(Relaxed);
        let cell = self.cell(pos);

        let word = cell.load(Acquire);
        if word == 0 {
            return None;
        }
        cell.store(0, Release);
        self.read.store(pos.wrapping_add(1), Release);
        Some(word)
    }

    /// Push shared with other writers.
    fn push_multi(&self, word: usize) -> bool {
        debug_assert_ne!(word, 0);

        loop {
            let pos = self.write.load(SeqCst);
            let cell = self.cell(pos);

            if cell.load(SeqCst) == 0 {
                if cell.compare_exchange(0, word, SeqCst, SeqCst).is_ok() {
                    self.advance_write(pos);
                    return true;
                }
                continue;
            }

            // Occupied: either the ring is full, or the cursor lags behind
            // a finished push and needs a shove.
            if pos.wrapping_sub(self.read.load(SeqCst)) as usize >= N {
                return false;
            }
            self.advance_write(pos);
        }
    }

    /// Pop shared with other readers.
    fn pop_multi(&self) -> Option<usize> {
        loop {
            let pos = self.read.load(SeqCst);
            let cell = self.cell(pos);

            let word = cell.load(SeqCst);
            if word != 0 {
                if cell.compare_exchange(word, 0, SeqCst, SeqCst).is_ok() {
                    self.advance_read(pos);
                    return Some(word);
                }
                continue;
            }

            if pos == self.write.load(SeqCst) {
                return None;
            }
            self.advance_read(pos);
        }
    }

    // Best-effort cursor bumps; a failed CAS means someone else already
    // moved it.
    fn advance_write(&self, pos: u32) {
        let _ = self.write.compare_exchange(pos, pos.wrapping_add(1), SeqCst, SeqCst);
    }

    fn advance_read(&self, pos: u32) {
        let _ = self.read.compare_exchange(pos, pos.wrapping_add(1), SeqCst, SeqCst);
    }
}

macro_rules! ring_variant {
    (
        $(#[$doc:meta])*
        $name:ident, $push:ident, $pop:ident
    ) => {
        $(#[$doc])*
        pub struct $name<T: Slot, const N: usize> {
            state: RingState<N>,
            _marker: std::marker::PhantomData<T>,
        }

        unsafe impl<T: Slot + Send, const N: usize> Send for $name<T, N> {}
        unsafe impl<T: Slot + Send, const N: usize> Sync for $name<T, N> {}

        impl<T: Slot, const N: usize> $name<T, N> {
            pub fn new() -> $name<T, N> {
                $name { state: RingState::new(), _marker: std::marker::PhantomData }
            }

            pub const fn capacity(&self) -> usize {
                N
            }

            /// Entries currently queued; advisory under concurrency.
            pub fn size(&self) -> usize {
                self.state.size()
            }

            pub fn is_empty(&self) -> bool {
                self.size() == 0
            }

            /// Add a value; false when the ring is full.
            pub fn push(&self, value: T) -> bool {
                self.state.$push(value.into_word())
            }

            /// Take the oldest value, if any.
            pub fn pop(&self) -> Option<T> {
                self.state.$pop().map(T::from_word)
            }
        }

        impl<T: Slot, const N: usize> Default for $name<T, N> {
            fn default() -> $name<T, N> {
                $name::new()
            }
        }
    };
}

ring_variant! {
    /// Bounded FIFO for one producer and one consumer.
    RingSrsw, push_single, pop_single
}

ring_variant! {
    /// Bounded FIFO for any number of producers and consumers.
    RingMrmw, push_multi, pop_multi
}

ring_variant! {
    /// Bounded FIFO for many producers and a single consumer.
    RingSrmw, push_multi, pop_single
}

ring_variant! {
    /// Bounded FIFO for a single producer and many consumers.
    RingMrsw, push_single, pop_multi
}
