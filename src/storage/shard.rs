//! Shard file
//!
//! One physical partition: a JSON object of key -> record, plus the writes
//! accepted since the last flush.
//!
//! ## State
//! current state = on-disk JSON ∪ pending puts − pending removes
//!
//! ## Flush Cycle
//! 1. Lock the shard
//! 2. Read + decrypt the current file
//! 3. Apply pending puts, then pending removes
//! 4. Serialize (+ encrypt) into a temp sibling, fsync it
//! 5. Close descriptors, rename temp over the real path (bounded retry)
//! 6. fsync the directory, reopen the descriptor
//!
//! A failed cycle puts the taken queues back; nothing is dropped.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};

use crate::cache::LruCache;
use crate::config::Config;
use crate::crypto::Cipher;
use crate::error::{Result, ShardKvError};
use crate::record::DataRecord;
use crate::sync::CoopMutex;

use super::fsio;

/// Outcome of a point lookup
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Hit(DataRecord),
    Miss,
    /// The shard failed its integrity check; the disk cannot be consulted
    Unknown,
    /// The shard was replaced by a rehash; route again
    Retired,
}

/// Result of the startup integrity check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Integrity {
    /// File parsed cleanly
    Clean { records: usize },
    /// Some entries were unreadable; the file was rewritten without them
    Healed { kept: usize, dropped: usize },
    /// File could not be parsed; the shard is dirty
    Dirty { reason: String },
}

#[derive(Default)]
struct Queues {
    puts: HashMap<String, DataRecord>,
    removes: HashSet<String>,
}

impl Queues {
    fn is_empty(&self) -> bool {
        self.puts.is_empty() && self.removes.is_empty()
    }
}

/// A single shard file
pub struct Shard {
    name: String,
    path: PathBuf,
    config: Arc<Config>,
    cipher: Option<Cipher>,

    cache: Mutex<LruCache<DataRecord>>,
    queues: Mutex<Queues>,
    /// Keys present in the file as of the last read or flush
    disk_keys: Mutex<HashSet<String>>,

    dirty: AtomicBool,
    retired: AtomicBool,
    flushes: AtomicUsize,

    /// Serializes every read-modify-write cycle on the file
    mutex: CoopMutex,
    /// Read descriptor, only touched under `mutex`
    descriptor: tokio::sync::Mutex<Option<File>>,
}

impl Shard {
    pub fn new(dir: &Path, name: impl Into<String>, config: Arc<Config>, cipher: Option<Cipher>) -> Self {
        let name = name.into();
        Self {
            path: dir.join(&name),
            name,
            cache: Mutex::new(LruCache::new(config.cache_capacity)),
            config,
            cipher,
            queues: Mutex::new(Queues::default()),
            disk_keys: Mutex::new(HashSet::new()),
            dirty: AtomicBool::new(false),
            retired: AtomicBool::new(false),
            flushes: AtomicUsize::new(0),
            mutex: CoopMutex::new(),
            descriptor: tokio::sync::Mutex::new(None),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Open the backing file and run the integrity check
    ///
    /// With `create`, a missing or empty file is initialized to `{}`. Without
    /// it a missing file means lost data and marks the shard dirty.
    pub async fn init(&self, create: bool) -> Result<Integrity> {
        let _guard = self.mutex.lock().await;

        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !create => {
                return Ok(self.mark_dirty("file is missing".to_string()));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };

        if text.trim().is_empty() {
            if !create {
                return Ok(self.mark_dirty("file is empty".to_string()));
            }
            self.write_records(&BTreeMap::new()).await?;
            self.dirty.store(false, Ordering::SeqCst);
            return Ok(Integrity::Clean { records: 0 });
        }

        let status = self.check_integrity(&text).await?;
        if !matches!(status, Integrity::Dirty { .. }) {
            self.dirty.store(false, Ordering::SeqCst);
            *self.descriptor.lock().await = Some(File::open(&self.path).await?);
        }
        Ok(status)
    }

    async fn check_integrity(&self, text: &str) -> Result<Integrity> {
        let plain = match self.unseal(text) {
            Ok(plain) => plain,
            Err(e) => return Ok(self.mark_dirty(e.to_string())),
        };

        let raw: serde_json::Map<String, serde_json::Value> = match serde_json::from_str(&plain) {
            Ok(raw) => raw,
            Err(e) => return Ok(self.mark_dirty(e.to_string())),
        };

        let total = raw.len();
        let mut records = BTreeMap::new();
        for (key, value) in raw {
            match serde_json::from_value::<DataRecord>(value) {
                Ok(record) if record.key == key => {
                    records.insert(key, record);
                }
                Ok(_) => warn!(shard = %self.name, key = %key, "Dropping entry stored under the wrong key"),
                Err(e) => warn!(shard = %self.name, key = %key, error = %e, "Dropping unreadable entry"),
            }
        }

        let kept = records.len();
        if kept == total {
            *self.disk_keys.lock() = records.into_keys().collect();
            return Ok(Integrity::Clean { records: kept });
        }

        // Partially readable: rewrite the normalized JSON
        self.write_records(&records).await?;
        info!(shard = %self.name, kept, dropped = total - kept, "Shard self-healed");
        Ok(Integrity::Healed {
            kept,
            dropped: total - kept,
        })
    }

    fn mark_dirty(&self, reason: String) -> Integrity {
        warn!(shard = %self.name, reason = %reason, "Shard failed integrity check");
        self.dirty.store(true, Ordering::SeqCst);
        Integrity::Dirty { reason }
    }

    /// Replace the file contents with exactly `records` (durably)
    ///
    /// Used when a rehash or repair creates this shard.
    pub async fn write_all(&self, records: &BTreeMap<String, DataRecord>) -> Result<()> {
        let _guard = self.mutex.lock().await;
        self.write_records(records).await?;
        self.dirty.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Empty the shard: queues, cache and file
    pub async fn clear(&self) -> Result<()> {
        let _guard = self.mutex.lock().await;
        *self.queues.lock() = Queues::default();
        self.cache.lock().clear();
        self.write_records(&BTreeMap::new()).await?;
        self.dirty.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Retire the shard and delete its file
    ///
    /// Waits for any in-flight cycle; afterwards every lookup reports
    /// `Lookup::Retired` and flushes are no-ops.
    pub async fn unlink(&self) -> Result<()> {
        let _guard = self.mutex.lock().await;
        self.retired.store(true, Ordering::SeqCst);
        self.descriptor.lock().await.take();
        self.cache.lock().clear();
        fsio::remove_if_exists(&self.path).await?;
        fsio::remove_if_exists(&fsio::temp_path(&self.path)).await?;
        debug!(shard = %self.name, "Shard unlinked");
        Ok(())
    }

    // =========================================================================
    // Point Operations
    // =========================================================================

    /// Look up a key: cache, then pending queues, then disk
    pub async fn get(&self, key: &str) -> Result<Lookup> {
        if self.is_retired() {
            return Ok(Lookup::Retired);
        }
        if let Some(record) = self.cache.lock().get(key) {
            return Ok(Lookup::Hit(record));
        }
        if let Some(lookup) = self.pending_lookup(key) {
            return Ok(lookup);
        }
        if self.is_dirty() {
            return Ok(Lookup::Unknown);
        }

        let _guard = self.mutex.lock().await;
        if self.is_retired() {
            return Ok(Lookup::Retired);
        }
        // A flush may have failed and restored its queues while we waited
        if let Some(lookup) = self.pending_lookup(key) {
            return Ok(lookup);
        }

        let mut records = self.read_disk().await?;

        // The read is a suspension point; a write may have landed meanwhile.
        // Holding the queues keeps a concurrent remove from slipping in
        // between the check and the cache fill.
        let queues = self.queues.lock();
        if let Some(record) = queues.puts.get(key) {
            return Ok(Lookup::Hit(record.clone()));
        }
        if queues.removes.contains(key) {
            return Ok(Lookup::Miss);
        }
        match records.remove(key) {
            Some(mut record) => {
                record.shard = Some(self.name.clone());
                self.cache.lock().put(key, record.clone());
                Ok(Lookup::Hit(record))
            }
            None => Ok(Lookup::Miss),
        }
    }

    /// Queue a write (the caller has already logged it)
    pub fn put(&self, mut record: DataRecord) {
        record.shard = Some(self.name.clone());

        // Lock order: queues, then cache
        let mut queues = self.queues.lock();
        self.cache.lock().put(record.key.clone(), record.clone());
        queues.removes.remove(&record.key);
        queues.puts.insert(record.key.clone(), record);
    }

    /// Queue a removal (the caller has already logged it)
    pub fn remove(&self, key: &str) {
        let mut queues = self.queues.lock();
        self.cache.lock().remove(key);
        queues.puts.remove(key);
        queues.removes.insert(key.to_string());
    }

    pub fn remove_many(&self, keys: &[String]) {
        for key in keys {
            self.remove(key);
        }
    }

    fn pending_lookup(&self, key: &str) -> Option<Lookup> {
        let queues = self.queues.lock();
        if let Some(record) = queues.puts.get(key) {
            return Some(Lookup::Hit(record.clone()));
        }
        if queues.removes.contains(key) {
            return Some(Lookup::Miss);
        }
        None
    }

    // =========================================================================
    // Scans
    // =========================================================================

    /// Every record matching `predicate` (disk ∪ puts − removes)
    ///
    /// Matches are used to warm the cache, up to its capacity.
    pub async fn get_all<F>(&self, predicate: F) -> Result<Vec<DataRecord>>
    where
        F: Fn(&DataRecord) -> bool,
    {
        if self.is_dirty() {
            return Err(self.integrity_error("shard is dirty"));
        }

        // Held until the cache is filled so no flush can run in between
        let _guard = self.mutex.lock().await;
        let records = self.merged_state().await?;
        let matches: Vec<DataRecord> = records
            .into_values()
            .filter(|record| predicate(record))
            .collect();

        // Queued keys changed after the read; `put` already cached the live ones
        let queues = self.queues.lock();
        let mut cache = self.cache.lock();
        let capacity = cache.capacity();
        let untouched = matches
            .iter()
            .filter(|r| !queues.puts.contains_key(&r.key) && !queues.removes.contains(&r.key));
        for record in untouched.take(capacity) {
            cache.put(record.key.clone(), record.clone());
        }
        drop(cache);
        drop(queues);
        Ok(matches)
    }

    /// First record matching `predicate`, trying the cache before the disk
    pub async fn find_one<F>(&self, predicate: F) -> Result<Option<DataRecord>>
    where
        F: Fn(&DataRecord) -> bool,
    {
        if let Some(record) = self.cache.lock().find_one(|r| predicate(r)) {
            return Ok(Some(record));
        }
        let records = self.snapshot().await?;
        Ok(records.into_values().find(|record| predicate(record)))
    }

    /// Full current state of the shard
    pub async fn snapshot(&self) -> Result<BTreeMap<String, DataRecord>> {
        if self.is_dirty() {
            return Err(self.integrity_error("shard is dirty"));
        }

        let _guard = self.mutex.lock().await;
        self.merged_state().await
    }

    /// Disk state with the queues applied (caller holds `mutex`)
    async fn merged_state(&self) -> Result<BTreeMap<String, DataRecord>> {
        let mut records = self.read_disk().await?;

        let queues = self.queues.lock();
        for (key, record) in &queues.puts {
            records.insert(key.clone(), record.clone());
        }
        for key in &queues.removes {
            records.remove(key);
        }
        for record in records.values_mut() {
            record.shard = Some(self.name.clone());
        }
        Ok(records)
    }

    // =========================================================================
    // Flush
    // =========================================================================

    /// Write the pending queues into the file
    ///
    /// Returns false when there was nothing to do (or the shard is dirty or
    /// retired). On error the queues are restored and the error propagates.
    pub async fn flush(&self) -> Result<bool> {
        let _guard = self.mutex.lock().await;
        if self.is_retired() || self.is_dirty() {
            return Ok(false);
        }

        let taken = {
            let mut queues = self.queues.lock();
            if queues.is_empty() {
                return Ok(false);
            }
            std::mem::take(&mut *queues)
        };

        match self.apply_queues(&taken).await {
            Ok(count) => {
                self.flushes.fetch_add(1, Ordering::Relaxed);
                debug!(
                    shard = %self.name,
                    puts = taken.puts.len(),
                    removes = taken.removes.len(),
                    records = count,
                    "Shard flushed"
                );
                Ok(true)
            }
            Err(e) => {
                warn!(shard = %self.name, error = %e, "Flush failed, keeping pending writes");
                self.restore_queues(taken);
                Err(e)
            }
        }
    }

    async fn apply_queues(&self, taken: &Queues) -> Result<usize> {
        let mut records = self.read_disk().await?;
        for (key, record) in &taken.puts {
            records.insert(key.clone(), record.clone());
        }
        for key in &taken.removes {
            records.remove(key);
        }
        self.write_records(&records).await?;
        Ok(records.len())
    }

    /// Merge queues taken by a failed flush back under newer writes
    fn restore_queues(&self, taken: Queues) {
        let mut queues = self.queues.lock();
        let newer = |queues: &Queues, key: &str| {
            queues.puts.contains_key(key) || queues.removes.contains(key)
        };

        for (key, record) in taken.puts {
            if !newer(&queues, &key) {
                queues.puts.insert(key, record);
            }
        }
        for key in taken.removes {
            if !newer(&queues, &key) {
                queues.removes.insert(key);
            }
        }
    }

    // =========================================================================
    // File I/O (callers hold `mutex`)
    // =========================================================================

    async fn read_disk(&self) -> Result<BTreeMap<String, DataRecord>> {
        let mut descriptor = self.descriptor.lock().await;
        if descriptor.is_none() {
            *descriptor = Some(File::open(&self.path).await?);
        }

        let mut text = String::new();
        if let Some(file) = descriptor.as_mut() {
            file.seek(SeekFrom::Start(0)).await?;
            file.read_to_string(&mut text).await?;
        }
        drop(descriptor);

        let records = self.decode(&text)?;
        *self.disk_keys.lock() = records.keys().cloned().collect();
        Ok(records)
    }

    async fn write_records(&self, records: &BTreeMap<String, DataRecord>) -> Result<()> {
        let text = self.encode(records)?;
        let tmp = fsio::temp_path(&self.path);
        fsio::write_synced(&tmp, text.as_bytes()).await?;

        self.descriptor.lock().await.take();

        let renamed = fsio::rename_with_retry(
            &tmp,
            &self.path,
            self.config.rename_attempts,
            self.config.rename_retry_delay(),
        )
        .await;
        if let Err(e) = renamed {
            let _ = fs::remove_file(&tmp).await;
            return Err(e);
        }

        if let Some(dir) = self.path.parent() {
            fsio::sync_dir(dir).await?;
        }
        *self.descriptor.lock().await = Some(File::open(&self.path).await?);
        *self.disk_keys.lock() = records.keys().cloned().collect();
        Ok(())
    }

    fn encode(&self, records: &BTreeMap<String, DataRecord>) -> Result<String> {
        let plain = serde_json::to_string(records)?;
        match &self.cipher {
            Some(cipher) => cipher.seal(&plain),
            None => Ok(plain),
        }
    }

    fn decode(&self, text: &str) -> Result<BTreeMap<String, DataRecord>> {
        let plain = self.unseal(text)?;
        serde_json::from_str(&plain).map_err(|e| self.integrity_error(&e.to_string()))
    }

    fn unseal(&self, text: &str) -> Result<String> {
        match &self.cipher {
            Some(cipher) => cipher
                .open(text)
                .map_err(|e| self.integrity_error(&e.to_string())),
            None => Ok(text.to_string()),
        }
    }

    fn integrity_error(&self, reason: &str) -> ShardKvError {
        ShardKvError::Integrity {
            shard: self.name.clone(),
            reason: reason.to_string(),
        }
    }

    // =========================================================================
    // Health & Accessors
    // =========================================================================

    /// Latency of a full read of the file
    pub async fn ping(&self) -> Result<Duration> {
        let _guard = self.mutex.lock().await;
        let started = Instant::now();
        self.read_disk().await?;
        Ok(started.elapsed())
    }

    /// Records the shard holds once pending writes are applied
    pub fn logical_size(&self) -> usize {
        let disk = self.disk_keys.lock();
        let queues = self.queues.lock();
        let added = queues.puts.keys().filter(|k| !disk.contains(*k)).count();
        let removed = queues.removes.iter().filter(|k| disk.contains(*k)).count();
        disk.len() + added - removed
    }

    /// Number of queued puts and removes
    pub fn pending_len(&self) -> usize {
        let queues = self.queues.lock();
        queues.puts.len() + queues.removes.len()
    }

    pub fn has_pending(&self) -> bool {
        !self.queues.lock().is_empty()
    }

    pub fn cached_len(&self) -> usize {
        self.cache.lock().len()
    }

    /// Completed flush cycles
    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::Relaxed)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
