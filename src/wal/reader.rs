//! WAL Reader
//!
//! Reads log headers and body lines back for recovery and repair.

use std::path::Path;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::error::{Result, ShardKvError};

use super::entry::IV_LEN;
use super::writer::HEADER_LEN;

/// One body line read back from a log
#[derive(Debug, Clone)]
pub struct LogLine {
    /// Byte offset of the line start
    pub offset: u64,
    /// Line text without the newline
    pub text: String,
    /// False when the file ended before a newline (torn write)
    pub terminated: bool,
}

/// Read the IV header; `Ok(None)` for a missing or empty file
pub async fn read_header(path: &Path) -> Result<Option<[u8; IV_LEN]>> {
    let file = match File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut reader = BufReader::new(file);

    let mut first = String::new();
    if reader.read_line(&mut first).await? == 0 {
        return Ok(None);
    }
    let mut second = String::new();
    reader.read_line(&mut second).await?;

    if second != "\n" {
        return Err(ShardKvError::WalCorruption(format!(
            "{path:?}: header is not followed by a blank line"
        )));
    }
    parse_iv(first.trim_end()).map(Some).ok_or_else(|| {
        ShardKvError::WalCorruption(format!("{path:?}: malformed IV header"))
    })
}

/// Read the header and every body line of a log
pub async fn read_lines(path: &Path) -> Result<Option<([u8; IV_LEN], Vec<LogLine>)>> {
    let Some(iv) = read_header(path).await? else {
        return Ok(None);
    };

    let mut reader = BufReader::new(File::open(path).await?);
    let mut lines = Vec::new();
    let mut offset = 0u64;
    let mut buf = String::new();

    loop {
        buf.clear();
        let read = reader.read_line(&mut buf).await?;
        if read == 0 {
            break;
        }
        if offset >= HEADER_LEN {
            let terminated = buf.ends_with('\n');
            lines.push(LogLine {
                offset,
                text: buf.trim_end_matches('\n').to_string(),
                terminated,
            });
        }
        offset += read as u64;
    }

    Ok(Some((iv, lines)))
}

/// Cut a log file at `offset` (removing an uncommitted or torn tail)
pub async fn truncate_at(path: &Path, offset: u64) -> Result<()> {
    let file = OpenOptions::new().write(true).open(path).await?;
    file.set_len(offset.max(HEADER_LEN)).await?;
    file.sync_all().await?;
    Ok(())
}

fn parse_iv(text: &str) -> Option<[u8; IV_LEN]> {
    let bytes = hex::decode(text).ok()?;
    bytes.try_into().ok()
}

