//! WAL Entry definitions
//!
//! Defines the structure of individual log entries and their two encodings:
//! the canonical string fed to the keyed hash (transaction log) and the
//! checksummed plaintext line (full-writer log).

use std::fmt;
use std::str::FromStr;

use crate::error::{Result, ShardKvError};
use crate::record::{DataRecord, Value, ValueType};

/// Field separator (ASCII unit separator; escaped inside JSON strings)
pub const SEP: char = '\u{1f}';

/// Length of the hex IV on header line 1
pub const IV_LEN: usize = 16;

/// Mutation kinds recorded in the logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Set,
    Delete,
    DeleteMany,
    Clear,
    NewFile,
    /// Checkpoint: everything before it is reflected in shard files
    Flush,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Set => "Set",
            Method::Delete => "Delete",
            Method::DeleteMany => "DeleteMany",
            Method::Clear => "Clear",
            Method::NewFile => "NewFile",
            Method::Flush => "Flush",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = ShardKvError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Set" => Ok(Method::Set),
            "Delete" => Ok(Method::Delete),
            "DeleteMany" => Ok(Method::DeleteMany),
            "Clear" => Ok(Method::Clear),
            "NewFile" => Ok(Method::NewFile),
            "Flush" => Ok(Method::Flush),
            other => Err(ShardKvError::WalCorruption(format!("unknown method '{other}'"))),
        }
    }
}

/// A single entry in the logs
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub method: Method,
    pub key: String,
    /// Stringified value (`Value::stringify`), or method-specific payload
    pub value: String,
    pub value_type: Option<ValueType>,
    pub ttl: Option<i64>,
}

impl LogEntry {
    fn bare(method: Method, key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            method,
            key: key.into(),
            value: value.into(),
            value_type: None,
            ttl: None,
        }
    }

    pub fn set(record: &DataRecord) -> Self {
        Self {
            method: Method::Set,
            key: record.key.clone(),
            value: record.value.stringify(),
            value_type: Some(record.value_type()),
            ttl: record.ttl,
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self::bare(Method::Delete, key, "")
    }

    /// One entry covering several deletions; the payload is a JSON key array
    pub fn delete_many(keys: &[String]) -> Result<Self> {
        Ok(Self::bare(Method::DeleteMany, "", serde_json::to_string(keys)?))
    }

    pub fn clear() -> Self {
        Self::bare(Method::Clear, "", "")
    }

    /// A shard file created as part of layout `generation` with `shard_count` files
    pub fn new_file(file_name: impl Into<String>, generation: u64, shard_count: usize) -> Self {
        Self::bare(
            Method::NewFile,
            file_name,
            format!("{generation}:{shard_count}"),
        )
    }

    pub fn flush() -> Self {
        Self::bare(Method::Flush, "", "")
    }

    /// Record carried by a `Set` entry
    pub fn to_record(&self) -> Result<DataRecord> {
        let value_type = match (self.method, self.value_type) {
            (Method::Set, Some(value_type)) => value_type,
            _ => {
                return Err(ShardKvError::WalCorruption(format!(
                    "{} entry for '{}' carries no record",
                    self.method, self.key
                )))
            }
        };

        Ok(DataRecord {
            key: self.key.clone(),
            value: Value::parse(value_type, &self.value)?,
            ttl: self.ttl,
            shard: None,
        })
    }

    /// Keys carried by a `DeleteMany` entry
    pub fn keys(&self) -> Result<Vec<String>> {
        serde_json::from_str(&self.value).map_err(|e| {
            ShardKvError::WalCorruption(format!("bad DeleteMany payload: {e}"))
        })
    }

    /// `(generation, shard_count)` carried by a `NewFile` entry
    pub fn layout(&self) -> Option<(u64, usize)> {
        let (generation, count) = self.value.split_once(':')?;
        Some((generation.parse().ok()?, count.parse().ok()?))
    }

    /// Plaintext fed to the keyed hash: `key SEP value SEP type SEP method SEP ttl`
    pub fn canonical(&self) -> String {
        format!(
            "{key}{SEP}{value}{SEP}{ty}{SEP}{method}{SEP}{ttl}",
            key = self.key,
            value = self.value,
            ty = self.value_type.map(|t| t.as_str()).unwrap_or(""),
            method = self.method,
            ttl = self.ttl.map(|t| t.to_string()).unwrap_or_default(),
        )
    }

    /// Full-writer log line (without newline):
    /// `crc32 SEP method SEP json(key) SEP type SEP ttl SEP json(value)`
    pub fn encode_line(&self) -> Result<String> {
        let payload = format!(
            "{method}{SEP}{key}{SEP}{ty}{SEP}{ttl}{SEP}{value}",
            method = self.method,
            key = serde_json::to_string(&self.key)?,
            ty = self.value_type.map(|t| t.as_str()).unwrap_or(""),
            ttl = self.ttl.map(|t| t.to_string()).unwrap_or_default(),
            value = serde_json::to_string(&self.value)?,
        );
        let crc = crc32fast::hash(payload.as_bytes());
        Ok(format!("{crc:08x}{SEP}{payload}"))
    }

    /// Parse a full-writer log line, verifying its checksum
    pub fn decode_line(line: &str) -> Result<Self> {
        let corrupt = |reason: &str| ShardKvError::WalCorruption(format!("{reason}: {line:?}"));

        let (crc_hex, payload) = line.split_once(SEP).ok_or_else(|| corrupt("missing checksum"))?;
        let expected = u32::from_str_radix(crc_hex, 16).map_err(|_| corrupt("bad checksum"))?;
        if crc32fast::hash(payload.as_bytes()) != expected {
            return Err(corrupt("checksum mismatch"));
        }

        let fields: Vec<&str> = payload.splitn(5, SEP).collect();
        let [method, key, ty, ttl, value] = fields.as_slice() else {
            return Err(corrupt("wrong field count"));
        };

        Ok(Self {
            method: method.parse()?,
            key: serde_json::from_str(key).map_err(|_| corrupt("bad key"))?,
            value: serde_json::from_str(value).map_err(|_| corrupt("bad value"))?,
            value_type: if ty.is_empty() { None } else { Some(ty.parse()?) },
            ttl: if ttl.is_empty() {
                None
            } else {
                Some(ttl.parse().map_err(|_| corrupt("bad ttl"))?)
            },
        })
    }
}
