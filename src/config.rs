//! Configuration for ShardKV
//!
//! Centralized configuration with sensible defaults. A single `Config` is
//! wrapped in an `Arc` and shared by the table, shard map, shards and
//! referencer.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, ShardKvError};

/// Main configuration for a ShardKV table
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Root directory for shard files
    /// Internal structure:
    ///   {data_dir}/
    ///     └── {table}/
    ///           ├── layout.json              (generation manifest)
    ///           └── {table}_0001_0000.json   (shard files)
    pub data_dir: PathBuf,

    /// File extension for shard files (without the dot)
    pub extension: String,

    /// Records per shard before a rehash is triggered
    pub max_records_per_shard: usize,

    /// Shard count of a fresh table, and lower bound after any rehash
    pub min_shards: usize,

    /// Per-shard LRU capacity (records)
    pub cache_capacity: usize,

    /// Redistribute shards once at startup
    pub rehash_on_boot: bool,

    /// Encryption key for shard files; `None` stores plain JSON
    pub encryption_key: Option<String>,

    // -------------------------------------------------------------------------
    // Flush Configuration
    // -------------------------------------------------------------------------
    /// Background checkpoint period (milliseconds)
    pub flush_interval_ms: u64,

    /// Rename attempts for the atomic shard replace
    pub rename_attempts: u32,

    /// Fixed delay between rename attempts (milliseconds)
    pub rename_retry_delay_ms: u64,

    // -------------------------------------------------------------------------
    // WAL Configuration
    // -------------------------------------------------------------------------
    /// Directory for the transaction and full-writer logs
    /// (defaults to `{data_dir}/wal`)
    pub wal_dir: Option<PathBuf>,

    /// Sync strategy: how often to fsync the logs
    pub wal_sync_strategy: WalSyncStrategy,

    /// Transaction log size (bytes) above which it is truncated after a checkpoint
    pub wal_truncate_threshold: u64,

    // -------------------------------------------------------------------------
    // Reference Configuration
    // -------------------------------------------------------------------------
    /// Directory for reference files (defaults to `{data_dir}/references`)
    pub reference_dir: Option<PathBuf>,

    /// Maximum size of one reference file (bytes)
    pub reference_max_bytes: u64,

    /// How long the in-memory reference index stays warm
    pub reference_cache: ReferenceCachePolicy,
}

/// WAL sync strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalSyncStrategy {
    /// fsync after every write (safest, slowest)
    EveryWrite,

    /// fsync after N uncommitted entries (balanced durability/performance)
    EveryNEntries { count: usize },
}

/// Lifetime of the in-memory reference index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceCachePolicy {
    /// Built once, kept until the table is cleared or repaired
    Persistent,

    /// Dropped and rebuilt from disk once older than the window
    Timed(Duration),
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./shardkv_data"),
            extension: "json".to_string(),
            max_records_per_shard: 10_000,
            min_shards: 1,
            cache_capacity: 1_000,
            rehash_on_boot: false,
            encryption_key: None,
            flush_interval_ms: 1_000,
            rename_attempts: 5,
            rename_retry_delay_ms: 50,
            wal_dir: None,
            wal_sync_strategy: WalSyncStrategy::EveryNEntries { count: 100 },
            wal_truncate_threshold: 4 * 1024 * 1024, // 4 MB
            reference_dir: None,
            reference_max_bytes: 1024 * 1024, // 1 MB
            reference_cache: ReferenceCachePolicy::Persistent,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_records_per_shard == 0 {
            return Err(ShardKvError::Config(
                "max_records_per_shard must be at least 1".to_string(),
            ));
        }
        if self.min_shards == 0 {
            return Err(ShardKvError::Config("min_shards must be at least 1".to_string()));
        }
        if self.cache_capacity == 0 {
            return Err(ShardKvError::Config("cache_capacity must be at least 1".to_string()));
        }
        if self.rename_attempts == 0 {
            return Err(ShardKvError::Config("rename_attempts must be at least 1".to_string()));
        }
        if self.extension.is_empty() || self.extension.contains('.') {
            return Err(ShardKvError::Config(format!(
                "invalid shard extension '{}'",
                self.extension
            )));
        }
        if let WalSyncStrategy::EveryNEntries { count: 0 } = self.wal_sync_strategy {
            return Err(ShardKvError::Config("sync count must be at least 1".to_string()));
        }
        if self.reference_max_bytes == 0 {
            return Err(ShardKvError::Config(
                "reference_max_bytes must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Directory holding the logs
    pub fn wal_dir(&self) -> PathBuf {
        self.wal_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("wal"))
    }

    /// Directory holding reference files
    pub fn reference_dir(&self) -> PathBuf {
        self.reference_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("references"))
    }

    /// Directory holding one table's shard files
    pub fn table_dir(&self, table: &str) -> PathBuf {
        self.data_dir.join(table)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn rename_retry_delay(&self) -> Duration {
        Duration::from_millis(self.rename_retry_delay_ms)
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the data directory (root for shard files)
    pub fn data_dir(mut self, path: impl AsRef<Path>) -> Self {
        self.config.data_dir = path.as_ref().to_path_buf();
        self
    }

    /// Set the shard file extension
    pub fn extension(mut self, ext: impl Into<String>) -> Self {
        self.config.extension = ext.into();
        self
    }

    /// Set the record count that triggers a rehash
    pub fn max_records_per_shard(mut self, count: usize) -> Self {
        self.config.max_records_per_shard = count;
        self
    }

    /// Set the minimum shard count
    pub fn min_shards(mut self, count: usize) -> Self {
        self.config.min_shards = count;
        self
    }

    /// Set the per-shard cache capacity
    pub fn cache_capacity(mut self, count: usize) -> Self {
        self.config.cache_capacity = count;
        self
    }

    /// Redistribute shards at startup
    pub fn rehash_on_boot(mut self, enabled: bool) -> Self {
        self.config.rehash_on_boot = enabled;
        self
    }

    /// Enable at-rest encryption with the given key
    pub fn encryption_key(mut self, key: impl Into<String>) -> Self {
        self.config.encryption_key = Some(key.into());
        self
    }

    /// Set the background checkpoint period (in milliseconds)
    pub fn flush_interval_ms(mut self, ms: u64) -> Self {
        self.config.flush_interval_ms = ms;
        self
    }

    /// Set the rename retry policy
    pub fn rename_retry(mut self, attempts: u32, delay_ms: u64) -> Self {
        self.config.rename_attempts = attempts;
        self.config.rename_retry_delay_ms = delay_ms;
        self
    }

    /// Set the log directory
    pub fn wal_dir(mut self, path: impl AsRef<Path>) -> Self {
        self.config.wal_dir = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set the WAL sync strategy
    pub fn wal_sync_strategy(mut self, strategy: WalSyncStrategy) -> Self {
        self.config.wal_sync_strategy = strategy;
        self
    }

    /// Set the transaction log truncation threshold (in bytes)
    pub fn wal_truncate_threshold(mut self, bytes: u64) -> Self {
        self.config.wal_truncate_threshold = bytes;
        self
    }

    /// Set the reference directory
    pub fn reference_dir(mut self, path: impl AsRef<Path>) -> Self {
        self.config.reference_dir = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set the maximum size of one reference file (in bytes)
    pub fn reference_max_bytes(mut self, bytes: u64) -> Self {
        self.config.reference_max_bytes = bytes;
        self
    }

    /// Set the reference index cache policy
    pub fn reference_cache(mut self, policy: ReferenceCachePolicy) -> Self {
        self.config.reference_cache = policy;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
