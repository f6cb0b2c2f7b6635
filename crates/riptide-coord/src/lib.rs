//! riptide-coord — coordination primitives.
//!
//! A small versioned node store with ZooKeeper-style semantics (versions,
//! sequential children, session-scoped ephemerals) plus the two recipes
//! built on it: a polling lock and a bucket partitioner. The convergence
//! loop uses the store directly for its divergent-group flags; the lock
//! and partitioner keep concurrent converger processes from stepping on
//! each other.

pub mod error;
pub mod lock;
pub mod partition;
pub mod store;

pub use error::{CoordError, CoordResult};
pub use lock::{Lock, LockError};
pub use partition::{DEFAULT_BUCKETS, Partitioner, bucket_of};
pub use store::{CoordStore, CreateMode, MemoryCoordStore, Stat};
