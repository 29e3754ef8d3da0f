//! Shared data models for the ingestion and query engine.
//!
//! Everything that crosses a module boundary lives here: identifiers,
//! the five sensor storage types and the dynamically typed [`Value`] that
//! carries a single sensor sample.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---

/// Every timestamp that leaves the ingest stage is an absolute instant.
pub type Timestamp = DateTime<Utc>;

macro_rules! int_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name(i64);

        impl $name {
            pub const fn new(id: i64) -> Self {
                Self(id)
            }

            pub const fn get(&self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub const fn get(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

int_id!(
    /// Owning project; scopes physical output tables.
    ProjectId
);
int_id!(SensorMapId);
int_id!(SensorId);
int_id!(
    /// Logical owner of a subset of rows in a shared output table.
    OutputId
);
uuid_id!(
    /// One concrete ingestion of files under a sensor map (a dataset).
    IngestId
);
uuid_id!(AnalysisId);

/// Storage type of a sensor column. Each sensor lives in exactly one
/// per-type table chosen from this set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Boolean,
    Datetime,
    Float,
    Integer,
    String,
}

impl StorageType {
    pub const ALL: [StorageType; 5] = [
        StorageType::Boolean,
        StorageType::Datetime,
        StorageType::Float,
        StorageType::Integer,
        StorageType::String,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StorageType::Boolean => "boolean",
            StorageType::Datetime => "datetime",
            StorageType::Float => "float",
            StorageType::Integer => "integer",
            StorageType::String => "string",
        }
    }

    /// Logical name of the per-type table holding sensors of this type.
    pub fn table_name(&self) -> &'static str {
        match self {
            StorageType::Boolean => "BooleanTableData",
            StorageType::Datetime => "TimeTableData",
            StorageType::Float => "FloatTableData",
            StorageType::Integer => "IntTableData",
            StorageType::String => "StringTableData",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, StorageType::Float | StorageType::Integer)
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StorageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // ---
        match s {
            "boolean" | "bool" => Ok(StorageType::Boolean),
            "datetime" => Ok(StorageType::Datetime),
            "float" => Ok(StorageType::Float),
            "integer" | "int" => Ok(StorageType::Integer),
            "string" => Ok(StorageType::String),
            other => Err(format!("unknown storage type '{other}'")),
        }
    }
}

/// A single typed sensor value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Datetime(Timestamp),
}

impl Value {
    pub fn storage_type(&self) -> StorageType {
        match self {
            Value::Boolean(_) => StorageType::Boolean,
            Value::Integer(_) => StorageType::Integer,
            Value::Float(_) => StorageType::Float,
            Value::String(_) => StorageType::String,
            Value::Datetime(_) => StorageType::Datetime,
        }
    }

    /// Numeric view used by arithmetic filters and aggregates. Booleans
    /// count as 0/1.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Integer(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::String(_) | Value::Datetime(_) => None,
        }
    }

    /// Total order for sorting: NaN sorts after every other float, and
    /// values of unrelated types order by storage type.
    pub fn total_cmp(&self, other: &Self) -> Ordering {
        // ---
        match (self, other) {
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Datetime(a), Value::Datetime(b)) => a.cmp(b),
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x.total_cmp(&y),
                _ => a.storage_type().cmp(&b.storage_type()),
            },
        }
    }

    pub fn as_timestamp(&self) -> Option<Timestamp> {
        match self {
            Value::Datetime(t) => Some(*t),
            _ => None,
        }
    }

    /// Convert into the given storage type where that is lossless or a
    /// plain rounding. Returns `None` when no sensible conversion exists.
    pub fn coerce(self, target: StorageType) -> Option<Value> {
        // ---
        match (self, target) {
            (v, t) if v.storage_type() == t => Some(v),
            (Value::Integer(i), StorageType::Float) => Some(Value::Float(i as f64)),
            (Value::Boolean(b), StorageType::Integer) => Some(Value::Integer(i64::from(b))),
            (Value::Boolean(b), StorageType::Float) => Some(Value::Float(if b { 1.0 } else { 0.0 })),
            (Value::Float(f), StorageType::Integer) if f.is_finite() => {
                Some(Value::Integer(f.round() as i64))
            }
            (Value::Integer(i), StorageType::Boolean) => Some(Value::Boolean(i != 0)),
            (Value::Float(f), StorageType::Boolean) => Some(Value::Boolean(f != 0.0)),
            (v, StorageType::String) => Some(Value::String(v.to_string())),
            _ => None,
        }
    }

    /// Build a value from a JSON scalar. Strings that parse as RFC 3339
    /// stay strings; callers that need timestamps coerce explicitly.
    pub fn from_json(value: &serde_json::Value) -> Option<Value> {
        // ---
        match value {
            serde_json::Value::Bool(b) => Some(Value::Boolean(*b)),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Some(Value::Integer(i)),
                None => n.as_f64().map(Value::Float),
            },
            serde_json::Value::String(s) => Some(Value::String(s.clone())),
            _ => None,
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        // ---
        match (self, other) {
            (Value::Boolean(a), Value::Boolean(b)) => a.partial_cmp(b),
            (Value::Integer(a), Value::Integer(b)) => a.partial_cmp(b),
            (Value::String(a), Value::String(b)) => a.partial_cmp(b),
            (Value::Datetime(a), Value::Datetime(b)) => a.partial_cmp(b),
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x.partial_cmp(&y),
                _ => None,
            },
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::String(s) => f.write_str(s),
            Value::Datetime(t) => f.write_str(&t.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Timestamp> for Value {
    fn from(v: Timestamp) -> Self {
        Value::Datetime(v)
    }
}
