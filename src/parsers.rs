//! Typed column parsers.
//!
//! A [`ColumnParser`] turns the raw string fields of one CSV row into a
//! single typed [`Value`]. Each variant knows which source columns it reads,
//! the storage type it produces, an optional default for empty input and,
//! for numeric kinds, the inclusive range a value must fall in.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use thiserror::Error;

use crate::catalog::Bounds;
use crate::models::{StorageType, Timestamp, Value};

/// Formats tried, in order, when no declared format matches.
const LOOSE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%Y/%m/%d %H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
    "%m/%d/%Y %I:%M:%S %p",
    "%m/%d/%Y %I:%M %p",
    "%m/%d/%y %H:%M:%S",
    "%m/%d/%y %H:%M",
    "%d-%b-%Y %H:%M:%S",
    "%d-%b-%Y %H:%M",
    "%b %d %Y %H:%M:%S",
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%m/%d/%Y",
    "%m/%d/%y",
    "%d-%b-%Y",
];

const TRUE_ALIASES: [&str; 4] = ["true", "yes", "y", "t"];
const FALSE_ALIASES: [&str; 4] = ["false", "no", "n", "f"];

// ---

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValueError {
    #[error("{value:?} is not a valid {kind}")]
    Invalid { kind: StorageType, value: String },

    #[error("{value} is outside the allowed range {range}")]
    OutOfRange { value: String, range: String },

    #[error("{value:?} does not exist in timezone {tz}")]
    NonexistentTime { value: String, tz: String },

    #[error("row has no column {0}")]
    MissingColumn(usize),
}

impl ValueError {
    fn invalid(kind: StorageType, value: &str) -> Self {
        ValueError::Invalid {
            kind,
            value: value.to_string(),
        }
    }

    fn out_of_range(value: f64, bounds: &Bounds) -> Self {
        // ---
        let render = |b: Option<f64>, open: &str| b.map_or(open.to_string(), |v| v.to_string());
        ValueError::OutOfRange {
            value: value.to_string(),
            range: format!("[{}, {}]", render(bounds.min, "-inf"), render(bounds.max, "inf")),
        }
    }

    pub fn is_out_of_range(&self) -> bool {
        matches!(self, ValueError::OutOfRange { .. })
    }
}

/// Attach `tz` to a naive local time. Ambiguous times (DST fall-back)
/// resolve to the earlier instant; times in a DST gap do not exist.
pub fn localize(naive: NaiveDateTime, tz: Tz) -> Option<Timestamp> {
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

fn parse_naive(text: &str, format: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(text, format)
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(text, format)
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

/// Parse `text` with the first matching format, falling back to a loose
/// parse. Strings with an explicit offset keep it; everything else is read
/// as local time in `tz`.
pub fn parse_datetime(text: &str, formats: &[String], tz: Tz) -> Result<Timestamp, ValueError> {
    // ---
    let text = text.trim();
    let nonexistent = || ValueError::NonexistentTime {
        value: text.to_string(),
        tz: tz.name().to_string(),
    };

    for format in formats {
        if format.contains("%z") || format.contains("%:z") {
            if let Ok(dt) = DateTime::parse_from_str(text, format) {
                return Ok(dt.with_timezone(&Utc));
            }
        } else if let Some(naive) = parse_naive(text, format) {
            return localize(naive, tz).ok_or_else(nonexistent);
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Ok(dt.with_timezone(&Utc));
    }
    LOOSE_FORMATS
        .iter()
        .find_map(|format| parse_naive(text, format))
        .ok_or_else(|| ValueError::invalid(StorageType::Datetime, text))
        .and_then(|naive| localize(naive, tz).ok_or_else(nonexistent))
}

/// Integer parse with base auto-detection: `0x` hex, `0o` octal, `0b`
/// binary, a bare leading `0` as legacy octal, decimal otherwise.
pub fn parse_integer(text: &str) -> Option<i64> {
    // ---
    let text = text.trim();
    let (negative, body) = match text.as_bytes().first() {
        Some(b'-') => (true, &text[1..]),
        Some(b'+') => (false, &text[1..]),
        _ => (false, text),
    };
    let body = body.to_ascii_lowercase();
    if body.starts_with('_') || body.ends_with('_') || body.contains("__") {
        return None;
    }
    let body = body.replace('_', "");

    let (radix, digits) = if let Some(d) = body.strip_prefix("0x") {
        (16, d)
    } else if let Some(d) = body.strip_prefix("0o") {
        (8, d)
    } else if let Some(d) = body.strip_prefix("0b") {
        (2, d)
    } else if body.len() > 1 && body.starts_with('0') {
        (8, &body[1..])
    } else {
        (10, body.as_str())
    };
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }

    let magnitude = i128::from_str_radix(digits, radix).ok()?;
    i64::try_from(if negative { -magnitude } else { magnitude }).ok()
}

pub fn parse_boolean(text: &str) -> Option<bool> {
    // ---
    let lower = text.trim().to_lowercase();
    if TRUE_ALIASES.contains(&lower.as_str()) {
        return Some(true);
    }
    if FALSE_ALIASES.contains(&lower.as_str()) {
        return Some(false);
    }
    parse_integer(&lower)
        .map(|i| i != 0)
        .or_else(|| lower.parse::<f64>().ok().map(|f| f != 0.0))
}

fn field(row: &[String], column: usize) -> Result<&str, ValueError> {
    row.get(column)
        .map(|s| s.trim())
        .ok_or(ValueError::MissingColumn(column))
}

fn check_range(value: f64, bounds: &Bounds) -> Result<(), ValueError> {
    if bounds.contains(value) {
        Ok(())
    } else {
        Err(ValueError::out_of_range(value, bounds))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatetimeParser {
    pub columns: Vec<usize>,
    pub separator: String,
    pub formats: Vec<String>,
    pub timezone: Tz,
    pub default: Option<Timestamp>,
}

impl DatetimeParser {
    pub fn new(columns: Vec<usize>, timezone: Tz) -> Self {
        Self {
            columns,
            separator: " ".to_string(),
            formats: Vec::new(),
            timezone,
            default: None,
        }
    }

    fn parse(&self, row: &[String]) -> Result<Option<Value>, ValueError> {
        // ---
        let parts = self
            .columns
            .iter()
            .map(|&c| field(row, c))
            .collect::<Result<Vec<_>, _>>()?;
        let text = parts.join(&self.separator);
        let text = text.trim();
        if text.is_empty() {
            return Ok(self.default.map(Value::Datetime));
        }
        parse_datetime(text, &self.formats, self.timezone).map(|t| Some(Value::Datetime(t)))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IntegerParser {
    pub column: usize,
    pub bounds: Bounds,
    pub default: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FloatParser {
    pub column: usize,
    pub bounds: Bounds,
    pub default: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BooleanParser {
    pub column: usize,
    pub default: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StringParser {
    pub column: usize,
    pub default: Option<String>,
}

/// A parser for one output column of an ingested row.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnParser {
    Datetime(DatetimeParser),
    Integer(IntegerParser),
    Float(FloatParser),
    Boolean(BooleanParser),
    String(StringParser),
}

impl ColumnParser {
    /// Parser for a sensor column of the given storage type.
    pub fn for_sensor(storage_type: StorageType, column: usize, bounds: Bounds, timezone: Tz) -> Self {
        // ---
        match storage_type {
            StorageType::Datetime => ColumnParser::Datetime(DatetimeParser::new(vec![column], timezone)),
            StorageType::Integer => ColumnParser::Integer(IntegerParser {
                column,
                bounds,
                default: None,
            }),
            StorageType::Float => ColumnParser::Float(FloatParser {
                column,
                bounds,
                default: None,
            }),
            StorageType::Boolean => ColumnParser::Boolean(BooleanParser {
                column,
                default: None,
            }),
            StorageType::String => ColumnParser::String(StringParser {
                column,
                default: None,
            }),
        }
    }

    pub fn storage_type(&self) -> StorageType {
        match self {
            ColumnParser::Datetime(_) => StorageType::Datetime,
            ColumnParser::Integer(_) => StorageType::Integer,
            ColumnParser::Float(_) => StorageType::Float,
            ColumnParser::Boolean(_) => StorageType::Boolean,
            ColumnParser::String(_) => StorageType::String,
        }
    }

    /// Raw columns this parser reads.
    pub fn source_columns(&self) -> Vec<usize> {
        match self {
            ColumnParser::Datetime(p) => p.columns.clone(),
            ColumnParser::Integer(p) => vec![p.column],
            ColumnParser::Float(p) => vec![p.column],
            ColumnParser::Boolean(p) => vec![p.column],
            ColumnParser::String(p) => vec![p.column],
        }
    }

    pub fn bounds(&self) -> Bounds {
        match self {
            ColumnParser::Integer(p) => p.bounds,
            ColumnParser::Float(p) => p.bounds,
            _ => Bounds::default(),
        }
    }

    /// Parse one row. Empty input yields the default, or `None` without one.
    pub fn parse(&self, row: &[String]) -> Result<Option<Value>, ValueError> {
        // ---
        match self {
            ColumnParser::Datetime(p) => p.parse(row),
            ColumnParser::Integer(p) => {
                let text = field(row, p.column)?;
                if text.is_empty() {
                    return Ok(p.default.map(Value::Integer));
                }
                let value = parse_integer(text)
                    .ok_or_else(|| ValueError::invalid(StorageType::Integer, text))?;
                check_range(value as f64, &p.bounds)?;
                Ok(Some(Value::Integer(value)))
            }
            ColumnParser::Float(p) => {
                let text = field(row, p.column)?;
                if text.is_empty() {
                    return Ok(p.default.map(Value::Float));
                }
                let value = text
                    .parse::<f64>()
                    .map_err(|_| ValueError::invalid(StorageType::Float, text))?;
                check_range(value, &p.bounds)?;
                Ok(Some(Value::Float(value)))
            }
            ColumnParser::Boolean(p) => {
                let text = field(row, p.column)?;
                if text.is_empty() {
                    return Ok(p.default.map(Value::Boolean));
                }
                parse_boolean(text)
                    .map(|b| Some(Value::Boolean(b)))
                    .ok_or_else(|| ValueError::invalid(StorageType::Boolean, text))
            }
            ColumnParser::String(p) => {
                let raw = row.get(p.column).ok_or(ValueError::MissingColumn(p.column))?;
                if raw.is_empty() {
                    return Ok(p.default.clone().map(Value::String));
                }
                Ok(Some(Value::String(raw.clone())))
            }
        }
    }
}
