//! Storage Module
//!
//! Hash-sharded JSON files.
//!
//! ## Responsibilities
//! - Hold each partition as one JSON object file (optionally encrypted)
//! - Queue writes in memory and apply them with an atomic replace
//! - Route keys to shards and grow the shard count under load
//! - Keep a generation manifest so a rehash is all-or-nothing on disk
//!
//! ## Directory Layout
//! ```text
//! {data_dir}/{table}/
//! ├── layout.json              {"generation":2,"shard_count":3}
//! ├── {table}_0002_0000.json   {"k1":{"key":"k1","value":"v","type":"string","ttl":null}}
//! ├── {table}_0002_0001.json   {}
//! └── {table}_0002_0002.json   {"iv":"..","data":".."}   (encrypted)
//! ```

pub mod fsio;
mod layout;
mod shard;
mod shard_map;

pub use layout::Layout;
pub use shard::{Integrity, Lookup, Shard};
pub use shard_map::{IntegrityReport, MapState, Order, RehashPlan, ShardMap};
