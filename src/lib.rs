//! Lock-free data structures built on epoch-based memory reclamation.
//!
//! The crate is organized around a single memory-reclamation discipline:
//! read-copy-update with two epochs. Readers bracket their accesses with
//! `enter`/`exit` (or an [`RcuGuard`]); writers unlink data with plain CAS
//! loops and hand the unlinked memory to [`Smr::defer`], which releases it
//! once every reader that could have observed it has exited its epoch.
//!
//! Two flavors of the scheme are provided:
//!
//! - [`Rcu`] is a self-contained instance: reclamation happens
//!   opportunistically when the last reader of a vacated epoch exits. The
//!   collections in [`sync`] each embed one.
//!
//! - [`GlobalRcu`] shares one process-wide epoch pair, with a registration
//!   node per thread so that entering a critical section touches no shared
//!   cache line. In exchange, reclamation only happens when someone calls
//!   [`GlobalRcu::gc`] — either directly or through a [`GcThread`].
//!
//! On top of the reclamation layer, [`sync`] provides an unbounded
//! Michael-Scott queue, a lock-free linear-probing hash map with
//! incremental resizing, an intrusive linked list with lock-free removal,
//! bounded ring queues, and a scalable non-zero indicator.
//!
//! # Example
//!
//! ```
//! use quiesce::sync::Map;
//!
//! let map: Map<u32, u32> = Map::new();
//! assert_eq!(map.insert(3, 81), Ok(true));
//! assert_eq!(map.insert(3, 82), Ok(false));
//! assert_eq!(map.find(&3), Some(81));
//!
//! let mut expected = 81;
//! assert_eq!(map.compare_exchange(&3, &mut expected, 27), Ok(true));
//! assert_eq!(map.remove(&3), Some(27));
//! assert_eq!(map.find(&3), None);
//! ```

pub mod mem;
pub mod sync;
mod tls;

pub use mem::atom::{Atomize, Boxed, OutOfMemory};
pub use mem::grcu::{GcThread, GlobalRcu};
pub use mem::rcu::{Rcu, RcuGuard, Smr};
