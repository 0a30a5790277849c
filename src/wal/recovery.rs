//! WAL Recovery
//!
//! Reconciles the two logs after a restart.
//!
//! The transaction log only holds one-way tokens, so the plaintext of the
//! entries written since the last checkpoint comes from the tail of the
//! full-writer log. Each plaintext entry must hash to the token at the same
//! position; trailing plaintext with no token was never committed and is cut
//! off, as is a torn final line in either file.

use std::path::Path;

use tracing::{debug, warn};

use crate::error::{Result, ShardKvError};

use super::entry::{LogEntry, Method};
use super::log::{token_for, LogPaths};
use super::reader::{read_lines, truncate_at};

/// Length of a hex HMAC-SHA256 token
const TOKEN_LEN: usize = 64;

/// Result of a recovery operation
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryResult {
    /// Number of committed entries after the last checkpoint
    pub entries_recovered: u64,

    /// Number of full-writer lines skipped for a bad checksum
    pub entries_corrupted: u64,

    /// Number of uncommitted plaintext entries dropped from the tail
    pub entries_discarded: u64,

    /// Whether either log was truncated (torn or uncommitted tail removed)
    pub was_truncated: bool,
}

/// Every decodable line of the full-writer log
#[derive(Debug, Default)]
pub struct FullScan {
    /// `(byte offset, entry)` in log order
    pub entries: Vec<(u64, LogEntry)>,
    /// Lines skipped for a bad checksum or encoding
    pub corrupted: u64,
    /// Offset of a torn final line, if any
    pub torn_tail: Option<u64>,
}

/// Handles WAL recovery after crash
pub struct WalRecovery;

impl WalRecovery {
    /// Recover the entries written since the last checkpoint
    ///
    /// This will:
    /// 1. Drop a torn final line from either log
    /// 2. Align the transaction tail with the full-writer tail
    /// 3. Cut off uncommitted plaintext entries
    /// 4. Return the committed entries in order
    pub async fn recover(paths: &LogPaths, hash_key: &[u8]) -> Result<(Vec<LogEntry>, RecoveryResult)> {
        Self::run(paths, hash_key, true).await
    }

    /// Verify the logs line up without modifying them
    pub async fn verify(paths: &LogPaths, hash_key: &[u8]) -> Result<RecoveryResult> {
        Self::run(paths, hash_key, false).await.map(|(_, result)| result)
    }

    /// Read every valid entry of the full-writer log
    pub async fn scan_full(path: &Path) -> Result<FullScan> {
        let Some((_, lines)) = read_lines(path).await? else {
            return Ok(FullScan::default());
        };

        let mut scan = FullScan::default();
        let last = lines.len().saturating_sub(1);

        for (index, line) in lines.into_iter().enumerate() {
            let decoded = if line.terminated {
                LogEntry::decode_line(&line.text)
            } else {
                Err(ShardKvError::WalCorruption("unterminated line".to_string()))
            };

            match decoded {
                Ok(entry) => scan.entries.push((line.offset, entry)),
                Err(_) if index == last => scan.torn_tail = Some(line.offset),
                Err(e) => {
                    warn!(offset = line.offset, error = %e, "Skipping corrupted full-log line");
                    scan.corrupted += 1;
                }
            }
        }

        Ok(scan)
    }

    async fn run(
        paths: &LogPaths,
        hash_key: &[u8],
        apply: bool,
    ) -> Result<(Vec<LogEntry>, RecoveryResult)> {
        let mut result = RecoveryResult::default();

        let Some((iv, mut lines)) = read_lines(&paths.transactions).await? else {
            return Ok((Vec::new(), result));
        };

        // Torn token at the end of the transaction log
        if let Some(last) = lines.last() {
            if !last.terminated || !is_token(&last.text) {
                let offset = last.offset;
                lines.pop();
                result.was_truncated = true;
                if apply {
                    truncate_at(&paths.transactions, offset).await?;
                }
            }
        }
        if let Some(bad) = lines.iter().find(|line| !is_token(&line.text)) {
            return Err(ShardKvError::WalCorruption(format!(
                "malformed token at offset {}",
                bad.offset
            )));
        }

        let flush_token = token_for(&LogEntry::flush(), hash_key, &iv)?;
        let tail_start = lines
            .iter()
            .rposition(|line| line.text == flush_token)
            .map_or(0, |i| i + 1);
        let tokens: Vec<&str> = lines[tail_start..].iter().map(|l| l.text.as_str()).collect();

        let scan = Self::scan_full(&paths.full).await?;
        result.entries_corrupted = scan.corrupted;
        if let Some(offset) = scan.torn_tail {
            result.was_truncated = true;
            if apply {
                truncate_at(&paths.full, offset).await?;
            }
        }

        // Normally the tail follows the last Flush line. If we crashed between
        // the two Flush appends, the last Flush line is itself uncommitted and
        // the tail starts after the one before it.
        let flushes: Vec<usize> = scan
            .entries
            .iter()
            .enumerate()
            .filter(|(_, (_, entry))| entry.method == Method::Flush)
            .map(|(i, _)| i)
            .collect();
        let mut starts = vec![flushes.last().map_or(0, |i| i + 1)];
        if flushes.len() >= 2 {
            starts.push(flushes[flushes.len() - 2] + 1);
        } else if !flushes.is_empty() {
            starts.push(0);
        }

        for start in starts {
            let region = &scan.entries[start..];
            if region.len() < tokens.len() {
                continue;
            }
            if !Self::matches(region, &tokens, hash_key, &iv)? {
                continue;
            }

            let committed: Vec<LogEntry> = region[..tokens.len()]
                .iter()
                .map(|(_, entry)| entry.clone())
                .collect();

            let uncommitted = &region[tokens.len()..];
            if let Some((offset, _)) = uncommitted.first() {
                debug!(count = uncommitted.len(), "Dropping uncommitted full-log tail");
                result.entries_discarded = uncommitted.len() as u64;
                result.was_truncated = true;
                if apply {
                    truncate_at(&paths.full, *offset).await?;
                }
            }

            result.entries_recovered = committed.len() as u64;
            return Ok((committed, result));
        }

        Err(ShardKvError::WalCorruption(format!(
            "{} transaction tokens have no matching full-log entries",
            tokens.len()
        )))
    }

    fn matches(
        region: &[(u64, LogEntry)],
        tokens: &[&str],
        hash_key: &[u8],
        iv: &[u8],
    ) -> Result<bool> {
        for ((_, entry), token) in region.iter().zip(tokens) {
            if token_for(entry, hash_key, iv)? != *token {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

fn is_token(text: &str) -> bool {
    text.len() == TOKEN_LEN && text.bytes().all(|b| b.is_ascii_hexdigit())
}
