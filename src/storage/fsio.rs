//! Durable file helpers
//!
//! Temp-file + fsync + rename + directory fsync, with a bounded rename retry.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::error::{Result, ShardKvError};

/// Sibling temp path: `shard.json` -> `shard.json.tmp`
pub fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write `contents` to `path` and fsync it
pub async fn write_synced(path: &Path, contents: &[u8]) -> Result<()> {
    let mut file = File::create(path).await?;
    file.write_all(contents).await?;
    file.flush().await?;
    file.sync_all().await?;
    Ok(())
}

/// Rename, retrying a fixed number of times with a fixed delay
pub async fn rename_with_retry(from: &Path, to: &Path, attempts: u32, delay: Duration) -> Result<()> {
    let attempts = attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match fs::rename(from, to).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < attempts => {
                warn!(from = ?from, to = ?to, attempt, error = %e, "Rename failed, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                warn!(from = ?from, to = ?to, attempt, error = %e, "Rename failed, giving up");
                return Err(ShardKvError::RenameExhausted {
                    path: to.to_path_buf(),
                    attempts,
                });
            }
        }
    }
}

/// fsync a directory so a rename inside it is durable
pub async fn sync_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let handle = File::open(dir).await?;
        handle.sync_all().await?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}

/// Atomically replace `path` with `contents`
pub async fn write_atomic(path: &Path, contents: &[u8], attempts: u32, delay: Duration) -> Result<()> {
    let tmp = temp_path(path);
    write_synced(&tmp, contents).await?;

    if let Err(e) = rename_with_retry(&tmp, path, attempts, delay).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e);
    }

    if let Some(parent) = path.parent() {
        sync_dir(parent).await?;
    }
    Ok(())
}

/// Remove a file, treating "already gone" as success
pub async fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
