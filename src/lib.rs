//! # ShardKV
//!
//! An embedded, file-backed key-value store with:
//! - Hash-sharded JSON files with atomic replace and optional encryption
//! - A write-ahead log pair with checkpointed crash recovery
//! - An append-only key -> shard reference index
//! - A bounded LRU cache per shard
//! - Full rebuild from a never-truncated mutation history
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Table                               │
//! │        (commit gate: shared writers / exclusive flush)       │
//! └──────┬──────────────────────┬───────────────────────┬───────┘
//!        │                      │                       │
//!        ▼                      ▼                       ▼
//! ┌─────────────┐      ┌─────────────────┐      ┌──────────────┐
//! │     WAL     │      │    ShardMap     │      │  Referencer  │
//! │ tx + full   │      │ xxh64 % shards  │      │ key -> shard │
//! └─────────────┘      └────────┬────────┘      └──────────────┘
//!                               │
//!                 ┌─────────────┼─────────────┐
//!                 ▼             ▼             ▼
//!           ┌──────────┐  ┌──────────┐  ┌──────────┐
//!           │  Shard   │  │  Shard   │  │  Shard   │
//!           │ LRU+queue│  │ LRU+queue│  │ LRU+queue│
//!           └──────────┘  └──────────┘  └──────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use shardkv::{Config, Table};
//!
//! # async fn demo() -> shardkv::Result<()> {
//! let config = Config::builder().data_dir("./data").build();
//! let table = Table::open("main", config).await?;
//!
//! table.set("a", "hello").await?;
//! assert_eq!(table.get("a").await?.map(|r| r.value), Some("hello".into()));
//!
//! table.close().await?;
//! # Ok(())
//! # }
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod record;
pub mod sync;
pub mod cache;
pub mod crypto;
pub mod wal;
pub mod storage;
pub mod reference;
pub mod table;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{ShardKvError, Result};
pub use config::{Config, ReferenceCachePolicy, WalSyncStrategy};
pub use record::{DataRecord, Value, ValueType};
pub use storage::Order;
pub use table::{PingReport, RepairReport, Table, TableStats};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of ShardKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
