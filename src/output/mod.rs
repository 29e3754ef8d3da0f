//! Analysis output tables.
//!
//! An application declares each of its output tables as
//! `{column name: column type}`. The multiset of column types is encoded
//! into a signature (`4d3f2i1s`) and the physical table is named
//! `<base>_<project>_<signature>`, so analyses with the same output shape
//! share one physical table. Physical columns are `field0..fieldN` in
//! sorted (type, name) order and every row carries the id of the logical
//! output that owns it.
//!
//! Sinks implement [`OutputSink`]: [`tables::TableOutput`] records into
//! the in-process [`tables::OutputTables`] registry, [`csv::CsvOutput`]
//! writes one CSV file per table for the command-line driver.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{ProjectId, StorageType, Timestamp, Value};

pub mod csv;
pub mod tables;

pub use self::csv::CsvOutput;
pub use tables::{OutputHandle, OutputTables, TableOutput};

/// Default prefix of physical output table names.
pub const OUTPUT_TABLE_BASE: &str = "appoutput";

/// One output row keyed by logical column name.
pub type OutputRow = IndexMap<String, Option<Value>>;

/// `{column name: column type}` in declaration order.
pub type FieldSpec = IndexMap<String, ColumnType>;

// ---

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("output table {0} is not defined")]
    UnknownTable(String),

    #[error("output table {0} is already defined")]
    DuplicateTable(String),

    #[error("output table {0} declares no columns")]
    EmptyTable(String),

    #[error("output table {table} has no column {column}")]
    UnknownColumn { table: String, column: String },

    #[error("column {table}.{column} expects {expected}, got {value}")]
    TypeMismatch {
        table: String,
        column: String,
        expected: ColumnType,
        value: String,
    },

    #[error("column {table}.{column} requires a value")]
    MissingValue { table: String, column: String },

    #[error("physical table {0} was created concurrently")]
    TableRace(String),

    #[error("output I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] ::csv::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Column type of an output table. `Timestamp` is a datetime that may not
/// be null. The declaration order is the sort order of signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Boolean,
    Datetime,
    Float,
    Integer,
    String,
    Timestamp,
}

impl ColumnType {
    pub fn letter(&self) -> char {
        match self {
            ColumnType::Boolean => 'b',
            ColumnType::Datetime => 'd',
            ColumnType::Float => 'f',
            ColumnType::Integer => 'i',
            ColumnType::String => 's',
            ColumnType::Timestamp => 't',
        }
    }

    pub fn storage_type(&self) -> StorageType {
        match self {
            ColumnType::Boolean => StorageType::Boolean,
            ColumnType::Datetime | ColumnType::Timestamp => StorageType::Datetime,
            ColumnType::Float => StorageType::Float,
            ColumnType::Integer => StorageType::Integer,
            ColumnType::String => StorageType::String,
        }
    }

    pub fn nullable(&self) -> bool {
        *self != ColumnType::Timestamp
    }

    /// PostgreSQL column type.
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Datetime | ColumnType::Timestamp => "TIMESTAMPTZ",
            ColumnType::Float => "DOUBLE PRECISION",
            ColumnType::Integer => "BIGINT",
            ColumnType::String => "TEXT",
        }
    }

    /// Coerce `value` into this column's type.
    fn check(&self, table: &str, column: &str, value: Option<Value>) -> Result<Option<Value>, OutputError> {
        // ---
        match value {
            None if self.nullable() => Ok(None),
            None => Err(OutputError::MissingValue {
                table: table.to_string(),
                column: column.to_string(),
            }),
            Some(v) => {
                let shown = v.to_string();
                v.coerce(self.storage_type())
                    .map(Some)
                    .ok_or_else(|| OutputError::TypeMismatch {
                        table: table.to_string(),
                        column: column.to_string(),
                        expected: *self,
                        value: shown,
                    })
            }
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnType::Boolean => "boolean",
            ColumnType::Datetime => "datetime",
            ColumnType::Float => "float",
            ColumnType::Integer => "integer",
            ColumnType::String => "string",
            ColumnType::Timestamp => "timestamp",
        };
        f.write_str(name)
    }
}

/// Fields sorted by (type, name).
pub fn sorted_fields(fields: &FieldSpec) -> Vec<(&str, ColumnType)> {
    // ---
    let mut sorted: Vec<(&str, ColumnType)> = fields.iter().map(|(n, t)| (n.as_str(), *t)).collect();
    sorted.sort_by(|a, b| (a.1, a.0).cmp(&(b.1, b.0)));
    sorted
}

/// `<count><letter>` for each column type present, in type order.
pub fn signature(fields: &FieldSpec) -> String {
    // ---
    let mut counts: Vec<(ColumnType, usize)> = Vec::new();
    for (_, ty) in sorted_fields(fields) {
        match counts.last_mut() {
            Some((last, n)) if *last == ty => *n += 1,
            _ => counts.push((ty, 1)),
        }
    }
    counts
        .into_iter()
        .map(|(ty, n)| format!("{n}{}", ty.letter()))
        .collect()
}

/// Physical shape of one logical output table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableLayout {
    pub physical: String,
    /// Logical name to (physical column, type), in physical column order.
    pub columns: IndexMap<String, (String, ColumnType)>,
}

impl TableLayout {
    pub fn new(base: &str, project: ProjectId, fields: &FieldSpec) -> Self {
        // ---
        let columns = sorted_fields(fields)
            .into_iter()
            .enumerate()
            .map(|(i, (name, ty))| (name.to_string(), (format!("field{i}"), ty)))
            .collect();
        Self {
            physical: format!("{base}_{project}_{}", signature(fields)),
            columns,
        }
    }

    pub fn column_types(&self) -> Vec<ColumnType> {
        self.columns.values().map(|(_, ty)| *ty).collect()
    }

    /// Check `row` against the layout and return its values in physical
    /// column order.
    pub fn encode(&self, table: &str, row: OutputRow) -> Result<Vec<Option<Value>>, OutputError> {
        encode_row(
            table,
            self.columns.iter().map(|(name, (_, ty))| (name.as_str(), *ty)),
            row,
        )
    }

    /// Map physical-order values back to logical names.
    pub fn decode(&self, values: &[Option<Value>]) -> OutputRow {
        self.columns.keys().cloned().zip(values.iter().cloned()).collect()
    }
}

/// Order and coerce the values of `row` by `columns`. Missing columns are
/// null; names not in `columns` are an error.
pub fn encode_row<'a>(
    table: &str,
    columns: impl IntoIterator<Item = (&'a str, ColumnType)>,
    mut row: OutputRow,
) -> Result<Vec<Option<Value>>, OutputError> {
    // ---
    let mut values = Vec::new();
    for (name, ty) in columns {
        let value = row.shift_remove(name).flatten();
        values.push(ty.check(table, name, value)?);
    }
    if let Some(column) = row.into_keys().next() {
        return Err(OutputError::UnknownColumn {
            table: table.to_string(),
            column,
        });
    }
    Ok(values)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// A message an application logged during its run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: Option<Timestamp>,
}

impl LogRecord {
    /// Forward the record to `tracing` at its own level.
    pub fn emit(&self) {
        // ---
        let time = self.timestamp.map(|t| t.to_rfc3339());
        match self.level {
            LogLevel::Debug => tracing::debug!(time = ?time, "{}", self.message),
            LogLevel::Info => tracing::info!(time = ?time, "{}", self.message),
            LogLevel::Warning => tracing::warn!(time = ?time, "{}", self.message),
            LogLevel::Error | LogLevel::Critical => tracing::error!(time = ?time, "{}", self.message),
        }
    }
}

/// Destination for an analysis' output rows and log messages. Rows and
/// messages are buffered until [`OutputSink::flush`].
pub trait OutputSink: Send {
    /// Declare an output table before any row is inserted into it.
    fn create_table(&mut self, name: &str, fields: &FieldSpec) -> Result<(), OutputError>;

    fn insert_row(&mut self, table: &str, row: OutputRow) -> Result<(), OutputError>;

    fn log(&mut self, message: &str, level: LogLevel, timestamp: Option<Timestamp>);

    fn flush(&mut self) -> Result<(), OutputError>;
}
