//! Sync Module
//!
//! Cooperative locking for read-modify-write disk cycles.
//!
//! ## Responsibilities
//! - Serialize the flush/read cycle of one shard
//! - Serialize rewrites of reference files
//! - Hand the lock to waiters in arrival order

mod mutex;

pub use mutex::{CoopGuard, CoopMutex};
