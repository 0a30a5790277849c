//! Record Module
//!
//! The value object stored in shards and carried through the logs.
//!
//! ## Responsibilities
//! - Tagged value type over the supported value shapes
//! - Lossless conversion to/from the on-disk JSON form
//! - Lossless conversion to/from the string form used in the logs
//! - Arithmetic helpers that produce new records
//!
//! ## Disk Format
//! ```text
//! {"key": "a", "value": "12345678901234567890", "type": "bigint", "ttl": null}
//! ```
//! `bigint`, `date` and `bytes` travel as strings and are rebuilt from the
//! `type` tag on load.

mod value;

pub use value::{Value, ValueType};

use chrono::Utc;
use serde::de::Error as _;
use serde::ser::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Result, ShardKvError};

/// Current wall-clock time in unix milliseconds
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// A single stored record
///
/// Records are never mutated in place: `add`/`subtract` return a new record
/// that the caller writes back through the table.
#[derive(Debug, Clone)]
pub struct DataRecord {
    pub key: String,
    pub value: Value,
    /// Absolute expiry (unix millis)
    pub ttl: Option<i64>,
    /// Shard file that owns the record; stamped on routing, never persisted
    pub shard: Option<String>,
}

impl PartialEq for DataRecord {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.value == other.value && self.ttl == other.ttl
    }
}

impl DataRecord {
    pub fn new(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            ttl: None,
            shard: None,
        }
    }

    /// Set an absolute expiry in unix milliseconds
    pub fn with_ttl(mut self, expires_at_ms: i64) -> Self {
        self.ttl = Some(expires_at_ms);
        self
    }

    /// Expire `ms` milliseconds from now
    pub fn expires_in(self, ms: i64) -> Self {
        self.with_ttl(now_millis().saturating_add(ms))
    }

    pub fn value_type(&self) -> ValueType {
        self.value.value_type()
    }

    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        matches!(self.ttl, Some(ttl) if ttl <= now_ms)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_millis())
    }

    /// Encode as a standalone JSON document
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a standalone JSON document
    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// New record holding `value + delta`
    pub fn add(&self, delta: &Value) -> Result<Self> {
        self.arithmetic(delta, "add", |a, b| a.checked_add(b), |a, b| a + b)
    }

    /// New record holding `value - delta`
    pub fn subtract(&self, delta: &Value) -> Result<Self> {
        self.arithmetic(delta, "subtract", |a, b| a.checked_sub(b), |a, b| a - b)
    }

    fn arithmetic(
        &self,
        delta: &Value,
        op: &str,
        int_op: fn(i128, i128) -> Option<i128>,
        float_op: fn(f64, f64) -> f64,
    ) -> Result<Self> {
        let value = match (&self.value, delta) {
            (Value::Number(a), Value::Number(b)) => Value::Number(float_op(*a, *b)),
            (Value::BigInt(a), Value::BigInt(b)) => {
                Value::BigInt(int_op(*a, *b).ok_or_else(|| ShardKvError::TypeMismatch {
                    key: self.key.clone(),
                    expected: format!("bigint result of {op} within 128 bits"),
                    found: "overflow".to_string(),
                })?)
            }
            (stored, delta) => {
                return Err(ShardKvError::TypeMismatch {
                    key: self.key.clone(),
                    expected: delta.value_type().to_string(),
                    found: stored.value_type().to_string(),
                })
            }
        };
        value.ensure_storable()?;

        Ok(Self {
            key: self.key.clone(),
            value,
            ttl: self.ttl,
            shard: self.shard.clone(),
        })
    }
}

// =============================================================================
// Serde
// =============================================================================

#[derive(Serialize, Deserialize)]
struct RawRecord {
    key: String,
    value: serde_json::Value,
    #[serde(rename = "type")]
    value_type: ValueType,
    #[serde(default)]
    ttl: Option<i64>,
}

impl Serialize for DataRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let raw = RawRecord {
            key: self.key.clone(),
            value: self.value.to_json().map_err(S::Error::custom)?,
            value_type: self.value.value_type(),
            ttl: self.ttl,
        };
        raw.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for DataRecord {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = RawRecord::deserialize(deserializer)?;
        let value = Value::from_json(raw.value_type, raw.value).map_err(D::Error::custom)?;
        Ok(Self {
            key: raw.key,
            value,
            ttl: raw.ttl,
            shard: None,
        })
    }
}
