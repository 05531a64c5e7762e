//! Lock-free data structures.

pub use self::list::{List, ListNode};
pub use self::lock::SpinLock;
pub use self::map::Map;
pub use self::queue::Queue;
pub use self::ring::{RingMrmw, RingMrsw, RingSrmw, RingSrsw, Slot};
pub use self::snzi::Snzi;

pub mod list;
pub mod lock;
pub mod map;
pub mod queue;
pub mod ring;
pub mod snzi;
