//! Write-ahead log pair
//!
//! Every mutation is appended to the full-writer log (plaintext, never
//! truncated) and then to the transaction log (keyed-hash tokens). The
//! transaction token is the commit point.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::config::Config;
use crate::crypto;
use crate::error::Result;

use super::entry::LogEntry;
use super::writer::LogWriter;

/// Locations of one table's logs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPaths {
    pub transactions: PathBuf,
    pub full: PathBuf,
}

impl LogPaths {
    pub fn new(dir: &Path, table: &str) -> Self {
        Self {
            transactions: dir.join(format!("{table}.transactions.log")),
            full: dir.join(format!("{table}.full.log")),
        }
    }
}

/// Token of `entry` under a log IV
pub fn token_for(entry: &LogEntry, hash_key: &[u8], iv: &[u8]) -> Result<String> {
    crypto::keyed_hash(&entry.canonical(), hash_key, iv)
}

/// Key for transaction tokens: the encryption key when configured
pub fn hash_key(config: &Config) -> Vec<u8> {
    config
        .encryption_key
        .as_deref()
        .unwrap_or_default()
        .as_bytes()
        .to_vec()
}

/// Appender over the transaction log and the full-writer log
pub struct WriteAheadLog {
    transactions: LogWriter,
    full: LogWriter,
    hash_key: Vec<u8>,
    truncate_threshold: u64,
    /// Mutations recorded since the last Flush marker
    since_checkpoint: u64,
}

impl WriteAheadLog {
    pub async fn open(paths: &LogPaths, config: &Config) -> Result<Self> {
        let transactions = LogWriter::open(&paths.transactions, config.wal_sync_strategy).await?;
        let full = LogWriter::open(&paths.full, config.wal_sync_strategy).await?;

        Ok(Self {
            transactions,
            full,
            hash_key: hash_key(config),
            truncate_threshold: config.wal_truncate_threshold,
            since_checkpoint: 0,
        })
    }

    /// Append one mutation to both logs
    pub async fn record(&mut self, entry: &LogEntry) -> Result<()> {
        let token = token_for(entry, &self.hash_key, self.transactions.iv())?;
        self.full.append_line(&entry.encode_line()?).await?;
        self.transactions.append_line(&token).await?;
        self.since_checkpoint += 1;
        Ok(())
    }

    /// Append a Flush marker; truncate the transaction log once it is large
    ///
    /// Must only be called once every preceding entry is reflected in the
    /// shard files. Returns true when the transaction log was truncated.
    pub async fn checkpoint(&mut self) -> Result<bool> {
        self.record(&LogEntry::flush()).await?;
        self.sync().await?;
        self.since_checkpoint = 0;

        if self.transactions.size() > self.truncate_threshold {
            debug!(
                size = self.transactions.size(),
                threshold = self.truncate_threshold,
                "Truncating transaction log"
            );
            self.transactions.truncate_to_header().await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Checkpoint and truncate the transaction log unconditionally
    pub async fn checkpoint_and_truncate(&mut self) -> Result<()> {
        self.record(&LogEntry::flush()).await?;
        self.sync().await?;
        self.since_checkpoint = 0;
        self.transactions.truncate_to_header().await
    }

    /// Start a fresh transaction log under a new IV
    ///
    /// The Flush line lands in the full-writer log first so both tails still
    /// line up if we crash before the reset completes.
    pub async fn reset(&mut self) -> Result<()> {
        self.full.append_line(&LogEntry::flush().encode_line()?).await?;
        self.full.sync().await?;
        self.transactions.reset().await?;
        self.since_checkpoint = 0;
        info!(path = ?self.transactions.path(), "Transaction log reset");
        Ok(())
    }

    pub async fn sync(&mut self) -> Result<()> {
        self.full.sync().await?;
        self.transactions.sync().await
    }

    /// Mutations not yet covered by a Flush marker
    pub fn since_checkpoint(&self) -> u64 {
        self.since_checkpoint
    }

    /// Transaction log size in bytes
    pub fn transaction_size(&self) -> u64 {
        self.transactions.size()
    }

    /// True if the transaction log holds only its header
    pub fn is_truncated(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn full_size(&self) -> u64 {
        self.full.size()
    }
}
