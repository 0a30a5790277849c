//! Write-Ahead Log (WAL) Module
//!
//! Provides durability guarantees through append-only logging.
//!
//! ## Responsibilities
//! - Append log entries before any mutation
//! - Keyed-hash tokens authenticating each transaction entry
//! - CRC32 checksums on full-writer lines for corruption detection
//! - Flush checkpoints and transaction log truncation
//! - Crash recovery and replay
//!
//! ## Files
//! ```text
//! {table}.transactions.log           {table}.full.log
//! ┌──────────────────────────┐       ┌──────────────────────────────────┐
//! │ hex IV                   │       │ hex IV                           │
//! │ (blank)                  │       │ (blank)                          │
//! │ token(entry 1)           │  <->  │ crc SEP Set SEP "a" SEP ...      │
//! │ token(entry 2)           │  <->  │ crc SEP Delete SEP "b" SEP ...   │
//! │ token(Flush)             │  <->  │ crc SEP Flush SEP "" SEP ...     │
//! └──────────────────────────┘       └──────────────────────────────────┘
//!   truncated after checkpoints         never truncated (full repair input)
//! ```

mod entry;
mod log;
mod reader;
mod recovery;
mod writer;

pub use entry::{LogEntry, Method, IV_LEN, SEP};
pub use log::{hash_key, token_for, LogPaths, WriteAheadLog};
pub use reader::{read_header, read_lines, truncate_at, LogLine};
pub use recovery::{FullScan, RecoveryResult, WalRecovery};
pub use writer::{LogWriter, HEADER_LEN};
