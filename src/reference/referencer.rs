//! Referencer implementation
//!
//! Reference files are bounded by `reference_max_bytes`; appends roll over to
//! a new file once the current one would exceed the bound.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::config::{Config, ReferenceCachePolicy, WalSyncStrategy};
use crate::error::Result;
use crate::storage::fsio;
use crate::sync::CoopMutex;
use crate::wal::SEP;

/// Location of one key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefEntry {
    /// Shard file name owning the key
    pub shard: String,
    /// Reference files holding a line for the key
    pub files: BTreeSet<u32>,
}

struct RefState {
    /// `None` while cold
    index: Option<HashMap<String, RefEntry>>,
    loaded_at: Option<Instant>,
    current_file: u32,
    current_size: u64,
}

/// Key -> shard index backed by append-only files
pub struct Referencer {
    dir: PathBuf,
    config: Arc<Config>,
    /// Serializes appends, rewrites and index loads
    mutex: CoopMutex,
    state: Mutex<RefState>,
}

impl Referencer {
    pub async fn open(dir: &Path, config: Arc<Config>) -> Result<Self> {
        fs::create_dir_all(dir).await?;

        let numbers = file_numbers(dir).await?;
        let current_file = numbers.last().copied().unwrap_or(1);
        let current_size = match fs::metadata(file_path(dir, current_file)).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            dir: dir.to_path_buf(),
            config,
            mutex: CoopMutex::new(),
            state: Mutex::new(RefState {
                index: None,
                loaded_at: None,
                current_file,
                current_size,
            }),
        })
    }

    // =========================================================================
    // Public API
    // =========================================================================

    /// Record that `key` lives in `shard`
    ///
    /// Builds the index first so an unchanged location appends nothing.
    pub async fn set_reference(&self, key: &str, shard: &str) -> Result<()> {
        let _guard = self.mutex.lock().await;
        self.expire_if_stale();
        self.load_locked().await?;

        let unchanged = {
            let state = self.state.lock();
            state
                .index
                .as_ref()
                .and_then(|index| index.get(key))
                .is_some_and(|entry| entry.shard == shard)
        };
        if unchanged {
            return Ok(());
        }

        let line = encode_line(key, shard)?;
        let file = {
            let mut state = self.state.lock();
            let len = line.len() as u64;
            if state.current_size > 0 && state.current_size + len > self.config.reference_max_bytes {
                state.current_file += 1;
                state.current_size = 0;
            }
            state.current_file
        };

        let mut handle = OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path(&self.dir, file))
            .await?;
        handle.write_all(line.as_bytes()).await?;
        handle.flush().await?;
        if self.config.wal_sync_strategy == WalSyncStrategy::EveryWrite {
            handle.sync_data().await?;
        }

        let mut state = self.state.lock();
        state.current_size += line.len() as u64;
        if let Some(index) = state.index.as_mut() {
            let entry = index.entry(key.to_string()).or_insert_with(|| RefEntry {
                shard: shard.to_string(),
                files: BTreeSet::new(),
            });
            entry.shard = shard.to_string();
            entry.files.insert(file);
        }
        Ok(())
    }

    /// Shard file recorded for `key`, building the index on first use
    pub async fn get_reference(&self, key: &str) -> Result<Option<String>> {
        self.expire_if_stale();
        if !self.is_warm() {
            let _guard = self.mutex.lock().await;
            self.load_locked().await?;
        }

        let state = self.state.lock();
        Ok(state
            .index
            .as_ref()
            .and_then(|index| index.get(key))
            .map(|entry| entry.shard.clone()))
    }

    /// Full index (loading it if cold)
    pub async fn get_all_references(&self) -> Result<HashMap<String, RefEntry>> {
        let _guard = self.mutex.lock().await;
        self.expire_if_stale();
        self.load_locked().await?;
        Ok(self.state.lock().index.clone().unwrap_or_default())
    }

    pub async fn delete_reference(&self, key: &str) -> Result<()> {
        self.delete_references(&[key.to_string()]).await.map(|_| ())
    }

    /// Remove the lines of every key in `keys`; returns how many keys were indexed
    pub async fn delete_references(&self, keys: &[String]) -> Result<usize> {
        let _guard = self.mutex.lock().await;
        self.expire_if_stale();
        self.load_locked().await?;

        let (files, removed) = {
            let mut state = self.state.lock();
            let mut files = BTreeSet::new();
            let mut removed = 0;
            if let Some(index) = state.index.as_mut() {
                for key in keys {
                    if let Some(entry) = index.remove(key) {
                        files.extend(entry.files);
                        removed += 1;
                    }
                }
            }
            (files, removed)
        };

        let doomed: HashSet<&str> = keys.iter().map(String::as_str).collect();
        for file in files {
            self.rewrite_file(file, &doomed).await?;
        }
        Ok(removed)
    }

    /// Replace every reference file with exactly `entries`
    pub async fn restart(&self, entries: Vec<(String, String)>) -> Result<()> {
        let _guard = self.mutex.lock().await;

        for number in file_numbers(&self.dir).await? {
            fsio::remove_if_exists(&file_path(&self.dir, number)).await?;
        }

        let max = self.config.reference_max_bytes;
        let mut index = HashMap::with_capacity(entries.len());
        let mut file = 1u32;
        let mut buffer = String::new();

        for (key, shard) in entries {
            let line = encode_line(&key, &shard)?;
            if !buffer.is_empty() && (buffer.len() + line.len()) as u64 > max {
                self.write_file(file, &buffer).await?;
                file += 1;
                buffer.clear();
            }
            buffer.push_str(&line);
            index.insert(
                key,
                RefEntry {
                    shard,
                    files: BTreeSet::from([file]),
                },
            );
        }
        if !buffer.is_empty() {
            self.write_file(file, &buffer).await?;
        }

        debug!(references = index.len(), files = file, "Reference index rebuilt");
        let mut state = self.state.lock();
        state.index = Some(index);
        state.loaded_at = Some(Instant::now());
        state.current_file = file;
        state.current_size = buffer.len() as u64;
        Ok(())
    }

    /// Drop every reference
    pub async fn clear(&self) -> Result<()> {
        self.restart(Vec::new()).await
    }

    /// Number of indexed keys, if the index is warm
    pub fn len(&self) -> Option<usize> {
        self.state.lock().index.as_ref().map(HashMap::len)
    }

    pub fn is_warm(&self) -> bool {
        self.state.lock().index.is_some()
    }

    /// Number of reference files on disk
    pub async fn file_count(&self) -> Result<usize> {
        Ok(file_numbers(&self.dir).await?.len())
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn expire_if_stale(&self) {
        let ReferenceCachePolicy::Timed(window) = self.config.reference_cache else {
            return;
        };
        let mut state = self.state.lock();
        if state.loaded_at.is_some_and(|at| at.elapsed() > window) {
            state.index = None;
            state.loaded_at = None;
        }
    }

    /// Build the index from disk if cold (caller holds `mutex`)
    async fn load_locked(&self) -> Result<()> {
        if self.is_warm() {
            return Ok(());
        }

        let mut index: HashMap<String, RefEntry> = HashMap::new();
        for number in file_numbers(&self.dir).await? {
            let text = fs::read_to_string(file_path(&self.dir, number)).await?;
            for (key, shard) in text.lines().filter_map(decode_line) {
                let entry = index.entry(key).or_insert_with(|| RefEntry {
                    shard: shard.clone(),
                    files: BTreeSet::new(),
                });
                entry.shard = shard;
                entry.files.insert(number);
            }
        }

        debug!(references = index.len(), "Reference index loaded");
        let mut state = self.state.lock();
        state.index = Some(index);
        state.loaded_at = Some(Instant::now());
        Ok(())
    }

    /// Read, filter and rewrite one file (deletion is not appendable)
    async fn rewrite_file(&self, number: u32, doomed: &HashSet<&str>) -> Result<()> {
        let path = file_path(&self.dir, number);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let mut kept = String::with_capacity(text.len());
        for line in text.lines() {
            let remove = decode_line(line).is_some_and(|(key, _)| doomed.contains(key.as_str()));
            if !remove {
                kept.push_str(line);
                kept.push('\n');
            }
        }

        self.write_file(number, &kept).await?;

        let mut state = self.state.lock();
        if state.current_file == number {
            state.current_size = kept.len() as u64;
        }
        Ok(())
    }

    async fn write_file(&self, number: u32, contents: &str) -> Result<()> {
        fsio::write_atomic(
            &file_path(&self.dir, number),
            contents.as_bytes(),
            self.config.rename_attempts,
            self.config.rename_retry_delay(),
        )
        .await
    }
}

fn file_path(dir: &Path, number: u32) -> PathBuf {
    dir.join(format!("ref_{number:06}.ref"))
}

/// "ref_000042.ref" → Some(42)
fn parse_file_number(name: &str) -> Option<u32> {
    name.strip_prefix("ref_")?.strip_suffix(".ref")?.parse().ok()
}

async fn file_numbers(dir: &Path) -> Result<Vec<u32>> {
    let mut numbers = Vec::new();
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if let Some(number) = parse_file_number(&entry.file_name().to_string_lossy()) {
            numbers.push(number);
        }
    }
    numbers.sort_unstable();
    Ok(numbers)
}

fn encode_line(key: &str, shard: &str) -> Result<String> {
    Ok(format!("{}{SEP}{shard}\n", serde_json::to_string(key)?))
}

fn decode_line(line: &str) -> Option<(String, String)> {
    let (key, shard) = line.split_once(SEP)?;
    let key: String = serde_json::from_str(key).ok()?;
    Some((key, shard.to_string()))
}
