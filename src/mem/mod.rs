//! Memory management for lock-free data structures.

pub mod atom;
pub mod grcu;
pub mod rcu;

mod cache_padded;

pub use self::cache_padded::CachePadded;
