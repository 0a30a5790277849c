//! Shard layout manifest
//!
//! `layout.json` names the live shard generation. Rehash and repair write the
//! new generation's files first and only then replace the manifest, so a
//! crash leaves either the old or the new layout fully intact. Files from any
//! other generation are leftovers and are removed on load.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ShardKvError};

use super::fsio;

/// Live shard generation and count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layout {
    pub generation: u64,
    pub shard_count: usize,
}

impl Layout {
    pub const FILE_NAME: &'static str = "layout.json";

    pub fn new(generation: u64, shard_count: usize) -> Self {
        Self {
            generation,
            shard_count: shard_count.max(1),
        }
    }

    /// Layout of a brand new table
    pub fn initial(min_shards: usize) -> Self {
        Self::new(1, min_shards)
    }

    /// The next generation with `shard_count` shards
    pub fn next(&self, shard_count: usize) -> Self {
        Self::new(self.generation + 1, shard_count)
    }

    /// Load the manifest; `Ok(None)` if the table has never been created
    pub async fn load(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(Self::FILE_NAME);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| ShardKvError::Integrity {
                shard: Self::FILE_NAME.to_string(),
                reason: e.to_string(),
            })
    }

    /// Atomically write the manifest
    pub async fn store(&self, dir: &Path, attempts: u32, delay: Duration) -> Result<()> {
        let text = serde_json::to_string(self)?;
        fsio::write_atomic(&dir.join(Self::FILE_NAME), text.as_bytes(), attempts, delay).await
    }

    /// `{table}_{generation:04}_{index:04}.{ext}`
    pub fn shard_name(&self, table: &str, index: usize, extension: &str) -> String {
        format!("{table}_{:04}_{index:04}.{extension}", self.generation)
    }

    pub fn shard_names(&self, table: &str, extension: &str) -> Vec<String> {
        (0..self.shard_count)
            .map(|i| self.shard_name(table, i, extension))
            .collect()
    }

    /// Generation encoded in a shard file name of `table`
    pub fn parse_generation(table: &str, file_name: &str, extension: &str) -> Option<u64> {
        let stem = file_name.strip_suffix(extension)?.strip_suffix('.')?;
        let rest = stem.strip_prefix(table)?.strip_prefix('_')?;
        let (generation, index) = rest.split_once('_')?;
        index.parse::<usize>().ok()?;
        generation.parse().ok()
    }
}
