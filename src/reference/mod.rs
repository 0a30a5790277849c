//! Reference Module
//!
//! Append-only key -> shard index for point lookups.
//!
//! ## Responsibilities
//! - Record which shard file owns each key
//! - Serve lookups from a lazily built in-memory index
//! - Filter deleted keys out of their reference files
//! - Rebuild everything from scratch after a rehash or repair
//!
//! ## File Format
//! ```text
//! ref_000001.ref
//! "user:1" SEP main_0001_0003.json
//! "user:2" SEP main_0001_0000.json
//! ```
//! Keys are JSON string literals; later lines override earlier ones.

mod referencer;

pub use referencer::{RefEntry, Referencer};
