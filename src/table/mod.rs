//! Table Module
//!
//! A named table: the shard map, the write-ahead log pair and the reference
//! index behind one async API.
//!
//! ## Responsibilities
//! - Log every mutation before it reaches the shards
//! - Serve point lookups through the reference index
//! - Checkpoint once every shard has flushed
//! - Recover on startup, lock on integrity failure, rebuild on demand
//!
//! ## Write Path
//! ```text
//!   set(k, v)
//!      │  commit gate (shared)
//!      ▼
//! ┌────────────┐   ┌───────────────────────┐   ┌─────────────────┐
//! │ Referencer │──▶│ full log ─▶ tx token  │──▶│ Shard queue/LRU │
//! └────────────┘   └───────────────────────┘   └────────┬────────┘
//!                                                       │ flush()
//!                                   commit gate (excl.) ▼
//!                                              ┌─────────────────┐
//!                                              │ shard files     │
//!                                              │ + Flush marker  │
//!                                              └─────────────────┘
//! ```
//!
//! ## Concurrency
//! Writers hold the commit gate shared from logging until their record is
//! queued. Checkpoint, clear, rehash and repair hold it exclusively, so a
//! Flush marker never lands between a logged entry and its queued write.

mod flusher;
mod recovery;
mod stats;

pub use stats::{PingReport, RepairReport, TableStats};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tracing::{debug, error, info};

use crate::config::Config;
use crate::crypto::Cipher;
use crate::error::{Result, ShardKvError};
use crate::record::{now_millis, DataRecord, Value};
use crate::reference::Referencer;
use crate::storage::{Lookup, Order, ShardMap};
use crate::sync::CoopMutex;
use crate::wal::{hash_key, LogEntry, LogPaths, WriteAheadLog};

use flusher::Flusher;

/// Handle to an open table; clones share the same state
#[derive(Clone)]
pub struct Table {
    inner: Arc<TableInner>,
}

struct TableInner {
    name: String,
    config: Arc<Config>,

    paths: LogPaths,
    hash_key: Vec<u8>,
    wal: AsyncMutex<WriteAheadLog>,

    map: ShardMap,
    references: Referencer,

    /// Shared by writers, exclusive for checkpoint/clear/rehash/repair
    gate: RwLock<()>,
    /// Serializes read-modify-write arithmetic
    arithmetic: CoopMutex,

    locked: AtomicBool,
    flusher: parking_lot::Mutex<Option<Flusher>>,
}

impl Table {
    /// Open (or create) table `name`, recover it and start the flush timer
    ///
    /// An integrity failure does not fail the open: the table comes up
    /// locked and only `full_repair` is accepted.
    pub async fn open(name: impl Into<String>, config: Config) -> Result<Self> {
        config.validate()?;
        let name = name.into();
        validate_name(&name)?;

        let config = Arc::new(config);
        let cipher = config.encryption_key.as_deref().map(Cipher::new).transpose()?;

        let paths = LogPaths::new(&config.wal_dir(), &name);
        let wal = WriteAheadLog::open(&paths, &config).await?;
        let references =
            Referencer::open(&config.reference_dir().join(&name), Arc::clone(&config)).await?;
        let map = ShardMap::new(
            name.clone(),
            &config.table_dir(&name),
            Arc::clone(&config),
            cipher,
        );

        let table = Self {
            inner: Arc::new(TableInner {
                hash_key: hash_key(&config),
                name,
                config,
                paths,
                wal: AsyncMutex::new(wal),
                map,
                references,
                gate: RwLock::new(()),
                arithmetic: CoopMutex::new(),
                locked: AtomicBool::new(false),
                flusher: parking_lot::Mutex::new(None),
            }),
        };

        let recovered = table.initialize().await?;
        table.start_flusher();

        info!(
            table = %table.inner.name,
            shards = table.inner.map.shard_count(),
            recovered = recovered.entries_recovered,
            locked = table.is_locked(),
            "Table opened"
        );
        Ok(table)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// True after an integrity failure, until `full_repair` succeeds
    pub fn is_locked(&self) -> bool {
        self.inner.locked.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Record stored under `key`, if present and not expired
    pub async fn get(&self, key: &str) -> Result<Option<DataRecord>> {
        self.ensure_unlocked()?;
        let record = self.lookup(key).await?;
        Ok(record.filter(|record| !record.is_expired()))
    }

    pub async fn has(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Every live record, optionally sorted by key and limited
    pub async fn all(&self, limit: Option<usize>, order: Option<Order>) -> Result<Vec<DataRecord>> {
        self.find_many(|_| true, limit, order).await
    }

    /// Live records matching `predicate`
    pub async fn find_many<F>(
        &self,
        predicate: F,
        limit: Option<usize>,
        order: Option<Order>,
    ) -> Result<Vec<DataRecord>>
    where
        F: Fn(&DataRecord) -> bool,
    {
        self.ensure_unlocked()?;
        let now = now_millis();
        self.inner
            .map
            .all(|record| !record.is_expired_at(now) && predicate(record), limit, order)
            .await
    }

    /// First live record matching `predicate`
    pub async fn find_one<F>(&self, predicate: F) -> Result<Option<DataRecord>>
    where
        F: Fn(&DataRecord) -> bool,
    {
        self.ensure_unlocked()?;
        let now = now_millis();
        self.inner
            .map
            .find_one(|record| !record.is_expired_at(now) && predicate(record))
            .await
    }

    /// Reference fast path, then hash routing
    async fn lookup(&self, key: &str) -> Result<Option<DataRecord>> {
        if let Some(name) = self.inner.references.get_reference(key).await? {
            if let Some(shard) = self.inner.map.shard_named(&name) {
                if let Lookup::Hit(record) = shard.get(key).await? {
                    return Ok(Some(record));
                }
            }
        }
        self.inner.map.get(key).await
    }

    // =========================================================================
    // Writes
    // =========================================================================

    pub async fn set(&self, key: impl Into<String>, value: impl Into<Value>) -> Result<DataRecord> {
        self.insert(DataRecord::new(key, value)).await
    }

    /// Store a full record (value and TTL)
    ///
    /// Durable once this returns: the entry is in both logs even if no flush
    /// has run yet. Non-finite numbers are rejected with `Serialization`.
    pub async fn insert(&self, record: DataRecord) -> Result<DataRecord> {
        self.ensure_unlocked()?;
        // Must fail before logging: a logged value that cannot be written
        // would block every later flush of its shard
        record.value.ensure_storable()?;

        let (stored, needs_rehash) = {
            let _gate = self.inner.gate.read().await;
            let shard = self.inner.map.route(&record.key)?;
            self.inner
                .references
                .set_reference(&record.key, shard.name())
                .await?;

            let mut wal = self.inner.wal.lock().await;
            wal.record(&LogEntry::set(&record)).await?;

            let mut stored = record.clone();
            stored.shard = Some(shard.name().to_string());
            (stored, self.inner.map.add(record)?)
        };

        if needs_rehash {
            self.rehash_if_needed().await?;
        }
        Ok(stored)
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.ensure_unlocked()?;
        {
            let _gate = self.inner.gate.read().await;
            let mut wal = self.inner.wal.lock().await;
            wal.record(&LogEntry::delete(key)).await?;
            self.inner.map.remove(key)?;
        }
        self.inner.references.delete_reference(key).await
    }

    /// Delete every live record matching `predicate`; returns how many
    ///
    /// The whole batch is one `DeleteMany` log entry.
    pub async fn delete_many<F>(&self, predicate: F) -> Result<usize>
    where
        F: Fn(&DataRecord) -> bool,
    {
        let keys: Vec<String> = self
            .find_many(predicate, None, None)
            .await?
            .into_iter()
            .map(|record| record.key)
            .collect();
        self.delete_keys(keys).await
    }

    /// Delete every record whose TTL has passed
    pub async fn purge_expired(&self) -> Result<usize> {
        self.ensure_unlocked()?;
        let now = now_millis();
        let keys: Vec<String> = self
            .inner
            .map
            .all(|record| record.is_expired_at(now), None, None)
            .await?
            .into_iter()
            .map(|record| record.key)
            .collect();

        let purged = self.delete_keys(keys).await?;
        if purged > 0 {
            debug!(table = %self.inner.name, purged, "Expired records purged");
        }
        Ok(purged)
    }

    async fn delete_keys(&self, keys: Vec<String>) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        {
            let _gate = self.inner.gate.read().await;
            let mut wal = self.inner.wal.lock().await;
            wal.record(&LogEntry::delete_many(&keys)?).await?;
            self.inner.map.remove_many(&keys)?;
        }
        self.inner.references.delete_references(&keys).await?;
        Ok(keys.len())
    }

    /// Empty the table: shard files become `{}` and the transaction log is
    /// truncated back to its header
    pub async fn clear(&self) -> Result<()> {
        self.ensure_unlocked()?;
        let _gate = self.inner.gate.write().await;
        let mut wal = self.inner.wal.lock().await;

        wal.record(&LogEntry::clear()).await?;
        self.inner.map.clear().await?;
        self.inner.references.clear().await?;
        wal.checkpoint_and_truncate().await?;

        info!(table = %self.inner.name, "Table cleared");
        Ok(())
    }

    // =========================================================================
    // Arithmetic
    // =========================================================================

    /// Add `delta` to a Number or BigInt record; a missing key starts at zero
    pub async fn add(&self, key: &str, delta: impl Into<Value>) -> Result<DataRecord> {
        let delta = delta.into();
        let _guard = self.inner.arithmetic.lock().await;
        let base = self.arithmetic_base(key, &delta).await?;
        self.insert(base.add(&delta)?).await
    }

    /// Subtract `delta` from a Number or BigInt record; a missing key starts at zero
    pub async fn subtract(&self, key: &str, delta: impl Into<Value>) -> Result<DataRecord> {
        let delta = delta.into();
        let _guard = self.inner.arithmetic.lock().await;
        let base = self.arithmetic_base(key, &delta).await?;
        self.insert(base.subtract(&delta)?).await
    }

    async fn arithmetic_base(&self, key: &str, delta: &Value) -> Result<DataRecord> {
        if let Some(record) = self.get(key).await? {
            return Ok(record);
        }
        let zero = match delta {
            Value::BigInt(_) => Value::BigInt(0),
            _ => Value::Number(0.0),
        };
        Ok(DataRecord::new(key, zero))
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn ensure_unlocked(&self) -> Result<()> {
        if self.is_locked() {
            return Err(ShardKvError::LockedTable {
                table: self.inner.name.clone(),
            });
        }
        Ok(())
    }

    fn lock_table(&self, reason: &str) {
        error!(table = %self.inner.name, reason, "Table locked; full repair required");
        self.inner.locked.store(true, Ordering::SeqCst);
    }
}

impl Drop for TableInner {
    fn drop(&mut self) {
        if let Some(flusher) = self.flusher.get_mut().take() {
            flusher.signal();
        }
    }
}

fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid {
        return Err(ShardKvError::Config(format!("invalid table name '{name}'")));
    }
    Ok(())
}
