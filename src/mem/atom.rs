//! Projection of values onto atomically-manipulable machine words.
//!
//! Lock-free buckets and cells can only CAS a machine word, so every key and
//! value type is first turned into an *atom*: a `usize` that either embeds
//! the value's bits directly or carries the address of an owned heap copy.
//! Each atomized type reserves two bit patterns its encoding can never
//! produce — [`EMPTY`](Atomize::EMPTY) for a never-used slot and
//! [`TOMBSTONE`](Atomize::TOMBSTONE) for a freed one.

use std::alloc::{self, Layout};
use std::ptr;

use thiserror::Error;

/// Allocation failure in the handle form of [`Atomize::alloc`].
///
/// The only non-local failure mode in the crate; everything else reports
/// through tri-state returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("out of memory")]
pub struct OutOfMemory;

/// Types that can be packed into a single atomic word.
///
/// # Safety
///
/// Implementations must guarantee all of the following, which the hash map
/// relies on for soundness:
///
/// - `EMPTY` and `TOMBSTONE` are distinct, nonzero, and neither is a bit
///   subset of the other.
/// - No atom returned by `alloc` has any bit of `EMPTY | TOMBSTONE` set.
///   The map borrows exactly that bit pattern to freeze buckets while they
///   migrate to a resized table.
/// - `load(alloc(v))` is equivalent to `v`, and `matches(alloc(v), &v)` is
///   true, for every representable `v`.
pub unsafe trait Atomize: Sized {
    /// Reserved bit pattern for a slot that was never written.
    const EMPTY: usize;

    /// Reserved bit pattern for a slot whose value was removed.
    const TOMBSTONE: usize;

    /// True when the encoding is a bit copy and `dealloc` is a no-op.
    const EMBEDDED: bool;

    /// Encode `value` into an atom. The handle form copies it to the
    /// heap; the caller keeps the original.
    ///
    /// Only the handle (non-embedded) form can fail, and only with
    /// [`OutOfMemory`].
    fn alloc(value: &Self) -> Result<usize, OutOfMemory>;

    /// Decode an atom produced by `alloc`.
    ///
    /// # Safety
    ///
    /// `atom` must come from `alloc` on this type and must not have been
    /// passed to `dealloc`.
    unsafe fn load(atom: usize) -> Self;

    /// Release whatever `alloc` acquired.
    ///
    /// # Safety
    ///
    /// Same contract as [`load`](Atomize::load), and the atom must not be
    /// used afterwards.
    unsafe fn dealloc(atom: usize);

    /// Compare an encoded atom against a borrowed value without allocating.
    ///
    /// # Safety
    ///
    /// Same contract as [`load`](Atomize::load).
    unsafe fn matches(atom: usize, value: &Self) -> bool;
}

const WORD_BITS: u32 = usize::BITS;

/// Most-significant-bit mask: the embedded encodings reserve the top two
/// bits of the word.
const fn msb_mask(pos: u32) -> usize {
    1 << (WORD_BITS - 1 - pos)
}

// Integers narrower than the word zero-extend through their unsigned
// reinterpretation, so they can never produce the reserved top bits.
macro_rules! atomize_narrow_int {
    ($($int:ty => $uint:ty),* $(,)*) => {$(
        unsafe impl Atomize for $int {
            const EMPTY: usize = msb_mask(0);
            const TOMBSTONE: usize = msb_mask(1);
            const EMBEDDED: bool = true;

            fn alloc(value: &Self) -> Result<usize, OutOfMemory> {
                Ok(*value as $uint as usize)
            }

            unsafe fn load(atom: usize) -> Self {
                atom as $uint as $int
            }

            unsafe fn dealloc(_atom: usize) {}

            unsafe fn matches(atom: usize, value: &Self) -> bool {
                atom == *value as $uint as usize
            }
        }
    )*};
}

atomize_narrow_int! {
    u8 => u8, u16 => u16, u32 => u32,
    i8 => u8, i16 => u16, i32 => u32,
}

// Full-width integers occupy the whole word, so the reserved top two bits
// eat into the value space: encoding a value with either bit set is a
// caller error (a magic-value collision).
macro_rules! atomize_word_int {
    ($($int:ty),* $(,)*) => {$(
        unsafe impl Atomize for $int {
            const EMPTY: usize = msb_mask(0);
            const TOMBSTONE: usize = msb_mask(1);
            const EMBEDDED: bool = true;

            fn alloc(value: &Self) -> Result<usize, OutOfMemory> {
                let atom = *value as usize;
                debug_assert_eq!(
                    atom & (Self::EMPTY | Self::TOMBSTONE), 0,
                    "value collides with a reserved magic bit pattern",
                );
                Ok(atom)
            }

            unsafe fn load(atom: usize) -> Self {
                atom as $int
            }

            unsafe fn dealloc(_atom: usize) {}

            unsafe fn matches(atom: usize, value: &Self) -> bool {
                atom == *value as usize
            }
        }
    )*};
}

atomize_word_int!(usize, isize);

#[cfg(target_pointer_width = "64")]
atomize_word_int!(u64, i64);

unsafe impl Atomize for bool {
    const EMPTY: usize = msb_mask(0);
    const TOMBSTONE: usize = msb_mask(1);
    const EMBEDDED: bool = true;

    fn alloc(value: &Self) -> Result<usize, OutOfMemory> {
        Ok(*value as usize)
    }

    unsafe fn load(atom: usize) -> Self {
        atom != 0
    }

    unsafe fn dealloc(_atom: usize) {}

    unsafe fn matches(atom: usize, value: &Self) -> bool {
        atom == *value as usize
    }
}

unsafe impl Atomize for char {
    const EMPTY: usize = msb_mask(0);
    const TOMBSTONE: usize = msb_mask(1);
    const EMBEDDED: bool = true;

    fn alloc(value: &Self) -> Result<usize, OutOfMemory> {
        Ok(*value as u32 as usize)
    }

    unsafe fn load(atom: usize) -> Self {
        // The atom came from `alloc`, so it holds a valid scalar value.
        char::from_u32_unchecked(atom as u32)
    }

    unsafe fn dealloc(_atom: usize) {}

    unsafe fn matches(atom: usize, value: &Self) -> bool {
        atom == *value as u32 as usize
    }
}

// Pointers keep their full bit pattern and hide the magic values in the low
// alignment bits instead. Requires the pointee to be at least 4-aligned.
macro_rules! atomize_ptr {
    ($($ptr:ty),* $(,)*) => {$(
        unsafe impl<T> Atomize for $ptr {
            const EMPTY: usize = 0b01;
            const TOMBSTONE: usize = 0b10;
            const EMBEDDED: bool = true;

            fn alloc(value: &Self) -> Result<usize, OutOfMemory> {
                debug_assert!(std::mem::align_of::<T>() >= 4);
                debug_assert_eq!(*value as usize & 0b11, 0);
                Ok(*value as usize)
            }

            unsafe fn load(atom: usize) -> Self {
                atom as $ptr
            }

            unsafe fn dealloc(_atom: usize) {}

            unsafe fn matches(atom: usize, value: &Self) -> bool {
                atom == *value as usize
            }
        }
    )*};
}

atomize_ptr!(*mut T, *const T);

/// Handle-form atomization for values of arbitrary size.
///
/// `Boxed<T>` is atomized as the address of an owned heap copy, allocated
/// with at least 4-byte alignment so the low bits are free for the magic
/// values. `load` clones the pointee; `dealloc` drops and frees it.
///
/// ```
/// use quiesce::sync::Map;
/// use quiesce::Boxed;
///
/// let map: Map<Boxed<String>, u64> = Map::new();
/// map.insert(Boxed("carrier".to_string()), 12).unwrap();
/// assert_eq!(map.find(&Boxed("carrier".to_string())), Some(12));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Boxed<T>(pub T);

impl<T> Boxed<T> {
    fn layout() -> Layout {
        assert!(std::mem::size_of::<T>() != 0, "cannot atomize a zero-sized type");
        // Pad the alignment so the low two bits of the address stay clear.
        Layout::new::<T>().align_to(4).expect("layout overflow")
    }
}

unsafe impl<T: Clone + PartialEq> Atomize for Boxed<T> {
    const EMPTY: usize = 0b01;
    const TOMBSTONE: usize = 0b10;
    const EMBEDDED: bool = false;

    fn alloc(value: &Self) -> Result<usize, OutOfMemory> {
        let layout = Self::layout();
        let raw = unsafe { alloc::alloc(layout) as *mut T };
        if raw.is_null() {
            return Err(OutOfMemory);
        }
        unsafe { ptr::write(raw, value.0.clone()) };
        Ok(raw as usize)
    }

    unsafe fn load(atom: usize) -> Self {
        Boxed((*(atom as *const T)).clone())
    }

    unsafe fn dealloc(atom: usize) {
        let raw = atom as *mut T;
        ptr::drop_in_place(raw);
        alloc::dealloc(raw as *mut u8, Self::layout());
    }

    unsafe fn matches(atom: usize, value: &Self) -> bool {
        *(atom as *const T) == value.0
    }
}
