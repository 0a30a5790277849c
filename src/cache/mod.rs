//! Cache Module
//!
//! Bounded in-memory cache of hot records, one instance per shard.
//!
//! ## Responsibilities
//! - Short-circuit disk reads for recently touched keys
//! - Evict the least recently touched entry when full
//!
//! ## Eviction
//! Every access stamps the entry with a logical clock tick. Eviction picks
//! the smallest stamp, with insertion order as the tie-breaker.

mod lru;

pub use lru::LruCache;
