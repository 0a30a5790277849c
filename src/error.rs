//! Error types for ShardKV
//!
//! Provides a unified error type for all operations.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using ShardKvError
pub type Result<T> = std::result::Result<T, ShardKvError>;

/// Unified error type for ShardKV operations
#[derive(Debug, Error)]
pub enum ShardKvError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Rename of {path:?} failed after {attempts} attempts")]
    RenameExhausted { path: PathBuf, attempts: u32 },

    // -------------------------------------------------------------------------
    // Integrity Errors
    // -------------------------------------------------------------------------
    #[error("Integrity check failed for shard {shard}: {reason}")]
    Integrity { shard: String, reason: String },

    #[error("Table '{table}' is locked after an integrity failure; run full_repair() to rebuild it")]
    LockedTable { table: String },

    #[error("Repair failed: {0}")]
    Repair(String),

    // -------------------------------------------------------------------------
    // WAL Errors
    // -------------------------------------------------------------------------
    #[error("WAL corruption detected: {0}")]
    WalCorruption(String),

    // -------------------------------------------------------------------------
    // Record Errors
    // -------------------------------------------------------------------------
    #[error("Type mismatch on key '{key}': expected {expected}, found {found}")]
    TypeMismatch {
        key: String,
        expected: String,
        found: String,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Crypto Errors
    // -------------------------------------------------------------------------
    #[error("Crypto error: {0}")]
    Crypto(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for ShardKvError {
    fn from(err: serde_json::Error) -> Self {
        ShardKvError::Serialization(err.to_string())
    }
}

impl ShardKvError {
    /// True for errors raised because the table is locked
    pub fn is_locked(&self) -> bool {
        matches!(self, ShardKvError::LockedTable { .. })
    }
}
