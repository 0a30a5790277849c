//! Record values
//!
//! One variant per supported value shape, with one conversion pair per form
//! (JSON for shard files, plain string for the logs).

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, ShardKvError};

/// Type tag persisted next to every value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    String,
    Number,
    Boolean,
    BigInt,
    Date,
    Bytes,
    Object,
}

impl ValueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::String => "string",
            ValueType::Number => "number",
            ValueType::Boolean => "boolean",
            ValueType::BigInt => "bigint",
            ValueType::Date => "date",
            ValueType::Bytes => "bytes",
            ValueType::Object => "object",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ValueType {
    type Err = ShardKvError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "string" => Ok(ValueType::String),
            "number" => Ok(ValueType::Number),
            "boolean" => Ok(ValueType::Boolean),
            "bigint" => Ok(ValueType::BigInt),
            "date" => Ok(ValueType::Date),
            "bytes" => Ok(ValueType::Bytes),
            "object" => Ok(ValueType::Object),
            other => Err(ShardKvError::Serialization(format!(
                "unknown value type '{other}'"
            ))),
        }
    }
}

/// A stored value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Number(f64),
    Boolean(bool),
    BigInt(i128),
    Date(DateTime<Utc>),
    Bytes(Bytes),
    Object(serde_json::Value),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::String(_) => ValueType::String,
            Value::Number(_) => ValueType::Number,
            Value::Boolean(_) => ValueType::Boolean,
            Value::BigInt(_) => ValueType::BigInt,
            Value::Date(_) => ValueType::Date,
            Value::Bytes(_) => ValueType::Bytes,
            Value::Object(_) => ValueType::Object,
        }
    }

    /// String form used in the logs
    pub fn stringify(&self) -> String {
        match self {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Boolean(b) => b.to_string(),
            Value::BigInt(i) => i.to_string(),
            Value::Date(d) => d.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            Value::Bytes(b) => hex::encode(b),
            Value::Object(o) => o.to_string(),
        }
    }

    /// Rebuild a value from its string form
    pub fn parse(value_type: ValueType, text: &str) -> Result<Self> {
        let invalid = |reason: String| {
            ShardKvError::Serialization(format!("invalid {value_type} value '{text}': {reason}"))
        };

        match value_type {
            ValueType::String => Ok(Value::String(text.to_string())),
            ValueType::Number => text
                .parse::<f64>()
                .map(Value::Number)
                .map_err(|e| invalid(e.to_string())),
            ValueType::Boolean => text
                .parse::<bool>()
                .map(Value::Boolean)
                .map_err(|e| invalid(e.to_string())),
            ValueType::BigInt => text
                .parse::<i128>()
                .map(Value::BigInt)
                .map_err(|e| invalid(e.to_string())),
            ValueType::Date => DateTime::parse_from_rfc3339(text)
                .map(|d| Value::Date(d.with_timezone(&Utc)))
                .map_err(|e| invalid(e.to_string())),
            ValueType::Bytes => hex::decode(text)
                .map(|b| Value::Bytes(Bytes::from(b)))
                .map_err(|e| invalid(e.to_string())),
            ValueType::Object => serde_json::from_str(text)
                .map(Value::Object)
                .map_err(|e| invalid(e.to_string())),
        }
    }

    /// Reject values that have no JSON form (non-finite numbers)
    pub fn ensure_storable(&self) -> Result<()> {
        match self {
            Value::Number(n) if !n.is_finite() => Err(ShardKvError::Serialization(format!(
                "number {n} has no JSON form"
            ))),
            _ => Ok(()),
        }
    }

    /// JSON form stored in shard files
    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(match self {
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .ok_or_else(|| {
                    ShardKvError::Serialization(format!("number {n} has no JSON form"))
                })?,
            Value::Boolean(b) => serde_json::Value::Bool(*b),
            Value::Object(o) => o.clone(),
            Value::BigInt(_) | Value::Date(_) | Value::Bytes(_) => {
                serde_json::Value::String(self.stringify())
            }
        })
    }

    /// Rebuild a value from its JSON form; the JSON shape must match the tag
    pub fn from_json(value_type: ValueType, json: serde_json::Value) -> Result<Self> {
        use serde_json::Value as Json;

        match (value_type, json) {
            (ValueType::String, Json::String(s)) => Ok(Value::String(s)),
            (ValueType::Number, Json::Number(n)) => n.as_f64().map(Value::Number).ok_or_else(|| {
                ShardKvError::Serialization(format!("number {n} out of range"))
            }),
            (ValueType::Boolean, Json::Bool(b)) => Ok(Value::Boolean(b)),
            (ValueType::BigInt | ValueType::Date | ValueType::Bytes, Json::String(s)) => {
                Value::parse(value_type, &s)
            }
            (ValueType::Object, json) => Ok(Value::Object(json)),
            (value_type, json) => Err(ShardKvError::Serialization(format!(
                "value {json} does not match type {value_type}"
            ))),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<i128> for Value {
    fn from(i: i128) -> Self {
        Value::BigInt(i)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(d: DateTime<Utc>) -> Self {
        Value::Date(d)
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Value::Bytes(b)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(Bytes::from(b))
    }
}

impl From<serde_json::Value> for Value {
    fn from(o: serde_json::Value) -> Self {
        Value::Object(o)
    }
}
