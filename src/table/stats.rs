//! Health and repair reports

use std::time::{Duration, Instant};

use crate::error::Result;

use super::Table;

/// Point-in-time counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableStats {
    pub shard_count: usize,
    pub generation: u64,
    /// Records once pending writes are applied
    pub records: usize,
    /// Queued puts and removes not yet flushed
    pub pending: usize,
    pub locked: bool,
}

/// Read latency of every shard
#[derive(Debug, Clone)]
pub struct PingReport {
    pub shards: Vec<(String, Duration)>,
    pub total: Duration,
}

impl PingReport {
    /// Slowest shard, if any
    pub fn slowest(&self) -> Option<&(String, Duration)> {
        self.shards.iter().max_by_key(|(_, latency)| *latency)
    }
}

/// Outcome of a full rebuild from the full-writer log
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairReport {
    /// Live records after the rebuild
    pub records: usize,
    /// Shard files written
    pub shards: usize,
    /// Log entries replayed
    pub entries_applied: u64,
    /// Log lines skipped as unreadable
    pub entries_corrupted: u64,
}

impl Table {
    pub fn stats(&self) -> TableStats {
        let layout = self.inner.map.layout();
        TableStats {
            shard_count: self.inner.map.shard_count(),
            generation: layout.generation,
            records: self.inner.map.logical_size(),
            pending: self.inner.map.pending_len(),
            locked: self.is_locked(),
        }
    }

    /// Time a full read of every shard file
    pub async fn ping(&self) -> Result<PingReport> {
        self.ensure_unlocked()?;
        let started = Instant::now();

        let mut shards = Vec::new();
        for shard in self.inner.map.shards() {
            let latency = shard.ping().await?;
            shards.push((shard.name().to_string(), latency));
        }

        Ok(PingReport {
            shards,
            total: started.elapsed(),
        })
    }
}
