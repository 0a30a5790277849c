//! Shard map
//!
//! Routes keys to shards by `xxh64(key) mod shard_count` and replaces the
//! whole shard set when the table grows.
//!
//! ## Rehash Protocol
//! 1. Snapshot every shard (disk ∪ pending − removed)
//! 2. Write and fsync every file of the next generation
//! 3. Store the manifest naming the next generation
//! 4. Swap the shard list (readers see old or new, never neither)
//! 5. Retire and delete the old files
//!
//! The caller serializes rehash against writers and logs the `NewFile`
//! entries before step 2.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};
use xxhash_rust::xxh64::xxh64;

use crate::config::Config;
use crate::crypto::Cipher;
use crate::error::{Result, ShardKvError};
use crate::record::DataRecord;

use super::fsio;
use super::layout::Layout;
use super::shard::{Integrity, Lookup, Shard};

/// Sort order for scans
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Ascending,
    Descending,
}

/// The live layout and its shards
pub struct MapState {
    pub layout: Layout,
    pub shards: Vec<Arc<Shard>>,
}

/// Integrity outcome of one shard at load time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityReport {
    pub shard: String,
    pub status: Integrity,
}

/// A computed redistribution, ready to be written
pub struct RehashPlan {
    pub layout: Layout,
    pub records: BTreeMap<String, DataRecord>,
}

/// Routes keys to shards
pub struct ShardMap {
    table: String,
    dir: PathBuf,
    config: Arc<Config>,
    cipher: Option<Cipher>,
    state: RwLock<Arc<MapState>>,
}

impl ShardMap {
    /// Create an empty map; `load` installs a layout
    pub fn new(table: impl Into<String>, dir: &Path, config: Arc<Config>, cipher: Option<Cipher>) -> Self {
        Self {
            table: table.into(),
            dir: dir.to_path_buf(),
            config,
            cipher,
            state: RwLock::new(Arc::new(MapState {
                layout: Layout::new(0, 1),
                shards: Vec::new(),
            })),
        }
    }

    /// Stable routing hash
    pub fn hash(key: &str) -> u64 {
        xxh64(key.as_bytes(), 0)
    }

    /// Shard index of `key` among `shard_count` shards
    pub fn index_for(key: &str, shard_count: usize) -> usize {
        (Self::hash(key) % shard_count.max(1) as u64) as usize
    }

    // =========================================================================
    // Loading
    // =========================================================================

    /// Open every shard of `layout`, replacing the current state
    ///
    /// `fresh` creates missing files (a new table). Files of other
    /// generations are removed.
    pub async fn load(&self, layout: Layout, fresh: bool) -> Result<Vec<IntegrityReport>> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let mut shards = Vec::with_capacity(layout.shard_count);
        let mut reports = Vec::with_capacity(layout.shard_count);
        for name in layout.shard_names(&self.table, &self.config.extension) {
            let shard = self.make_shard(name);
            let status = shard.init(fresh).await?;
            reports.push(IntegrityReport {
                shard: shard.name().to_string(),
                status,
            });
            shards.push(Arc::new(shard));
        }

        self.remove_stale(layout.generation).await?;
        *self.state.write() = Arc::new(MapState { layout, shards });
        Ok(reports)
    }

    fn make_shard(&self, name: String) -> Shard {
        Shard::new(&self.dir, name, Arc::clone(&self.config), self.cipher.clone())
    }

    /// Delete shard files (and temp files) not belonging to `generation`
    pub async fn remove_stale(&self, generation: u64) -> Result<()> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name().to_string_lossy().to_string();
            let base = file_name.strip_suffix(".tmp").unwrap_or(&file_name);
            let Some(found) = Layout::parse_generation(&self.table, base, &self.config.extension) else {
                continue;
            };
            if found != generation || base.len() != file_name.len() {
                debug!(file = %file_name, "Removing stale shard file");
                fsio::remove_if_exists(&entry.path()).await?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Routing
    // =========================================================================

    pub fn snapshot(&self) -> Arc<MapState> {
        Arc::clone(&self.state.read())
    }

    pub fn layout(&self) -> Layout {
        self.state.read().layout
    }

    pub fn shard_count(&self) -> usize {
        self.state.read().shards.len()
    }

    pub fn shards(&self) -> Vec<Arc<Shard>> {
        self.state.read().shards.clone()
    }

    /// Owner of `key` in the current layout
    pub fn route(&self, key: &str) -> Result<Arc<Shard>> {
        let state = self.state.read();
        if state.shards.is_empty() {
            return Err(ShardKvError::Integrity {
                shard: self.table.clone(),
                reason: "no shards loaded".to_string(),
            });
        }
        let index = Self::index_for(key, state.shards.len());
        Ok(Arc::clone(&state.shards[index]))
    }

    /// Current shard with the given file name
    pub fn shard_named(&self, name: &str) -> Option<Arc<Shard>> {
        self.state
            .read()
            .shards
            .iter()
            .find(|shard| shard.name() == name)
            .cloned()
    }

    // =========================================================================
    // Point Operations
    // =========================================================================

    /// Route, stamp and queue a record
    ///
    /// Returns true when the owning shard has outgrown the configured maximum.
    pub fn add(&self, mut record: DataRecord) -> Result<bool> {
        let shard = self.route(&record.key)?;
        record.shard = Some(shard.name().to_string());
        shard.put(record);
        Ok(shard.logical_size() > self.config.max_records_per_shard)
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        self.route(key)?.remove(key);
        Ok(())
    }

    pub fn remove_many(&self, keys: &[String]) -> Result<()> {
        for key in keys {
            self.remove(key)?;
        }
        Ok(())
    }

    /// Look the key up in its owning shard, re-routing past retired shards
    pub async fn get(&self, key: &str) -> Result<Option<DataRecord>> {
        loop {
            let shard = self.route(key)?;
            match shard.get(key).await? {
                Lookup::Hit(record) => return Ok(Some(record)),
                Lookup::Miss => return Ok(None),
                Lookup::Unknown => {
                    return Err(ShardKvError::Integrity {
                        shard: shard.name().to_string(),
                        reason: "shard is dirty; lookup result unknown".to_string(),
                    })
                }
                Lookup::Retired => continue,
            }
        }
    }

    pub async fn has(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    // =========================================================================
    // Scans
    // =========================================================================

    /// Records matching `predicate` across every shard
    ///
    /// With an order the merged result is sorted by key before `limit` is
    /// applied; without one the scan stops as soon as `limit` matches exist.
    pub async fn all<F>(&self, predicate: F, limit: Option<usize>, order: Option<Order>) -> Result<Vec<DataRecord>>
    where
        F: Fn(&DataRecord) -> bool,
    {
        let state = self.snapshot();
        let mut results = Vec::new();

        for shard in &state.shards {
            let mut matches = shard.get_all(&predicate).await?;
            results.append(&mut matches);
            if order.is_none() && limit.is_some_and(|limit| results.len() >= limit) {
                break;
            }
        }

        match order {
            Some(Order::Ascending) => results.sort_by(|a, b| a.key.cmp(&b.key)),
            Some(Order::Descending) => results.sort_by(|a, b| b.key.cmp(&a.key)),
            None => {}
        }
        if let Some(limit) = limit {
            results.truncate(limit);
        }
        Ok(results)
    }

    /// First match, checking every shard's cache before touching disk
    pub async fn find_one<F>(&self, predicate: F) -> Result<Option<DataRecord>>
    where
        F: Fn(&DataRecord) -> bool,
    {
        let state = self.snapshot();
        for shard in &state.shards {
            if let Some(record) = shard.find_one(&predicate).await? {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    // =========================================================================
    // Whole-Map Operations
    // =========================================================================

    /// Flush every shard; every shard is attempted, the first error is returned
    pub async fn flush_all(&self) -> Result<usize> {
        let state = self.snapshot();
        let mut flushed = 0;
        let mut first_error = None;

        for shard in &state.shards {
            match shard.flush().await {
                Ok(true) => flushed += 1,
                Ok(false) => {}
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(flushed),
        }
    }

    pub async fn clear(&self) -> Result<()> {
        let state = self.snapshot();
        for shard in &state.shards {
            shard.clear().await?;
        }
        Ok(())
    }

    /// Total queued writes across shards
    pub fn pending_len(&self) -> usize {
        self.state.read().shards.iter().map(|s| s.pending_len()).sum()
    }

    pub fn logical_size(&self) -> usize {
        self.state.read().shards.iter().map(|s| s.logical_size()).sum()
    }

    /// True if any shard holds more than the configured maximum
    pub fn needs_rehash(&self) -> bool {
        let max = self.config.max_records_per_shard;
        self.state.read().shards.iter().any(|s| s.logical_size() > max)
    }

    pub fn dirty_shards(&self) -> Vec<String> {
        self.state
            .read()
            .shards
            .iter()
            .filter(|s| s.is_dirty())
            .map(|s| s.name().to_string())
            .collect()
    }

    // =========================================================================
    // Rehash
    // =========================================================================

    /// Shard count for `total` records: grow, never shrink, respect the minimum
    pub fn target_count(&self, total: usize, current: usize, grow: bool) -> usize {
        let max = self.config.max_records_per_shard.max(1);
        let proportional = (2 * total).div_ceil(max);
        let floor = if grow { current + 1 } else { current };
        proportional.max(floor).max(self.config.min_shards)
    }

    /// Snapshot every shard and compute the next layout
    ///
    /// `grow` forces at least one more shard (a shard overflowed); without it
    /// the count only changes if the data calls for more shards.
    pub async fn plan_rehash(&self, grow: bool) -> Result<RehashPlan> {
        let state = self.snapshot();
        let mut records = BTreeMap::new();
        for shard in &state.shards {
            records.append(&mut shard.snapshot().await?);
        }

        let count = self.target_count(records.len(), state.shards.len(), grow);
        Ok(RehashPlan {
            layout: state.layout.next(count),
            records,
        })
    }

    /// Write the planned layout durably and make it live
    ///
    /// Returns the shards it replaced; the caller retires them once the
    /// reference index points at the new files.
    pub async fn apply(&self, plan: RehashPlan) -> Result<Vec<Arc<Shard>>> {
        let RehashPlan { layout, records } = plan;
        let names = layout.shard_names(&self.table, &self.config.extension);
        tokio::fs::create_dir_all(&self.dir).await?;

        let mut buckets: Vec<BTreeMap<String, DataRecord>> = vec![BTreeMap::new(); names.len()];
        for (key, record) in records {
            buckets[Self::index_for(&key, names.len())].insert(key, record);
        }

        let mut shards = Vec::with_capacity(names.len());
        for (name, bucket) in names.into_iter().zip(&buckets) {
            let shard = self.make_shard(name);
            shard.write_all(bucket).await?;
            shards.push(Arc::new(shard));
        }

        fsio::sync_dir(&self.dir).await?;
        layout
            .store(&self.dir, self.config.rename_attempts, self.config.rename_retry_delay())
            .await?;

        let old = {
            let mut state = self.state.write();
            let previous = std::mem::replace(&mut *state, Arc::new(MapState { layout, shards }));
            previous.shards.clone()
        };

        info!(
            table = %self.table,
            generation = layout.generation,
            shards = layout.shard_count,
            "Shard layout replaced"
        );
        Ok(old)
    }

    /// Delete replaced shards; failures are logged and left for the next load
    pub async fn retire(&self, old: Vec<Arc<Shard>>) {
        for shard in old {
            if let Err(e) = shard.unlink().await {
                warn!(shard = %shard.name(), error = %e, "Failed to delete retired shard");
            }
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}
