//! WAL Writer
//!
//! Handles appending lines to a header-prefixed log file. Both the
//! transaction log and the full-writer log share this layout:
//!
//! ```text
//! 3f1c...e9      <- hex IV (16 random bytes)
//!                <- blank line
//! line 1
//! line 2
//! ...
//! ```

use std::path::{Path, PathBuf};

use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::config::WalSyncStrategy;
use crate::error::Result;

use super::entry::IV_LEN;
use super::reader::read_header;

/// Bytes taken by the header (`32 hex chars + "\n\n"`)
pub const HEADER_LEN: u64 = (IV_LEN * 2 + 2) as u64;

/// Appends lines to a log file
pub struct LogWriter {
    path: PathBuf,
    file: File,
    iv: [u8; IV_LEN],
    sync_strategy: WalSyncStrategy,
    /// Writes since the last fsync
    uncommitted: usize,
    /// Current file size in bytes
    size: u64,
}

impl LogWriter {
    /// Open or create a log file
    ///
    /// A missing or empty file is initialized with a fresh random IV header.
    pub async fn open(path: &Path, sync_strategy: WalSyncStrategy) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let iv = match read_header(path).await? {
            Some(iv) => iv,
            None => {
                let iv: [u8; IV_LEN] = rand::random();
                write_fresh(path, &iv).await?;
                iv
            }
        };

        let file = OpenOptions::new().append(true).open(path).await?;
        let size = file.metadata().await?.len();

        Ok(Self {
            path: path.to_path_buf(),
            file,
            iv,
            sync_strategy,
            uncommitted: 0,
            size,
        })
    }

    /// Append one line (a trailing newline is added)
    pub async fn append_line(&mut self, line: &str) -> Result<()> {
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');

        self.file.write_all(&buf).await?;
        self.file.flush().await?;
        self.size += buf.len() as u64;
        self.uncommitted += 1;

        let should_sync = match self.sync_strategy {
            WalSyncStrategy::EveryWrite => true,
            WalSyncStrategy::EveryNEntries { count } => self.uncommitted >= count,
        };
        if should_sync {
            self.sync().await?;
        }
        Ok(())
    }

    /// Force sync to disk
    pub async fn sync(&mut self) -> Result<()> {
        self.file.flush().await?;
        self.file.sync_data().await?;
        self.uncommitted = 0;
        Ok(())
    }

    /// Drop every body line, keeping the IV header
    pub async fn truncate_to_header(&mut self) -> Result<()> {
        self.file.flush().await?;
        self.file.set_len(HEADER_LEN).await?;
        self.file.sync_all().await?;
        self.size = HEADER_LEN;
        self.uncommitted = 0;
        Ok(())
    }

    /// Replace the file with an empty log under a new random IV
    pub async fn reset(&mut self) -> Result<()> {
        let iv: [u8; IV_LEN] = rand::random();
        self.file.flush().await?;
        write_fresh(&self.path, &iv).await?;
        self.file = OpenOptions::new().append(true).open(&self.path).await?;
        self.iv = iv;
        self.size = HEADER_LEN;
        self.uncommitted = 0;
        Ok(())
    }

    pub fn iv(&self) -> &[u8; IV_LEN] {
        &self.iv
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// True if only the header is present
    pub fn is_empty(&self) -> bool {
        self.size <= HEADER_LEN
    }

    pub fn uncommitted_count(&self) -> usize {
        self.uncommitted
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

async fn write_fresh(path: &Path, iv: &[u8; IV_LEN]) -> Result<()> {
    let mut file = File::create(path).await?;
    file.write_all(format!("{}\n\n", hex::encode(iv)).as_bytes())
        .await?;
    file.sync_all().await?;
    Ok(())
}
