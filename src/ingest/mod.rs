//! Ingest orchestration.
//!
//! [`ingest_files`] pairs each file declared by a sensor map with its
//! uploaded stream and yields one [`FileIngest`] per file, in map order.
//! A `FileIngest` describes the columns it produces (timestamp first) and
//! lazily yields typed [`Row`]s. Row-level problems travel inside the row;
//! only problems that make the rest of a file unreadable are errors.

use std::collections::VecDeque;
use std::io::{Read, Seek};

use indexmap::IndexMap;
use thiserror::Error;

use crate::catalog::Catalog;
use crate::models::{StorageType, Value};
use crate::parsers::{ColumnParser, DatetimeParser, ValueError};
use crate::sensormap::{validate, SchemaErrors, SensorMap};
use crate::sniffer::{CsvFile, CsvRecord, ParseError, Records, SnifferOptions};
use crate::store::StoreError;

mod persist;

pub use persist::{run_ingest, CancelToken};

// ---

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("sensor map is invalid: {0}")]
    Schema(#[from] SchemaErrors),

    #[error("file {file}: {source}")]
    Parse {
        file: String,
        #[source]
        source: ParseError,
    },

    #[error("no upload is bound to file {0}")]
    MissingFile(String),

    #[error("upload {0} does not match any file in the sensor map")]
    UnknownFile(String),

    #[error("file {file}: {message}")]
    Timezone { file: String, message: String },

    #[error("ingest cancelled in file {file} at line {line}")]
    Cancelled { file: String, line: u64 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A parse failure for one output column of a row.
#[derive(Debug, Clone, PartialEq)]
pub struct RowError {
    pub line_num: u64,
    /// Raw CSV columns the failing parser read.
    pub source_columns: Vec<usize>,
    /// Output column (index into [`FileIngest::sensor_names`]).
    pub index: usize,
    pub error: ValueError,
}

/// One typed row. `columns[0]` is the timestamp; failing slots are `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub line_num: u64,
    pub byte_position: u64,
    pub columns: Vec<Option<Value>>,
    pub errors: Vec<RowError>,
}

impl Row {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// One uploaded file being ingested.
pub struct FileIngest<R> {
    pub file_key: String,
    pub size: u64,
    /// `None` for the timestamp column, then one sensor path per column.
    pub sensor_names: Vec<Option<String>>,
    pub types: Vec<StorageType>,
    pub rows: Rows<R>,
}

impl<R> std::fmt::Debug for FileIngest<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileIngest")
            .field("file_key", &self.file_key)
            .field("size", &self.size)
            .field("sensor_names", &self.sensor_names)
            .field("types", &self.types)
            .finish_non_exhaustive()
    }
}

/// Lazily parsed rows of one file. A header line is consumed without
/// being yielded. Stops after the first fatal error.
pub struct Rows<R> {
    file_key: String,
    records: Records<R>,
    parsers: Vec<ColumnParser>,
    headers: Vec<Option<String>>,
    sniffed_header: bool,
    first: bool,
}

impl<R> Rows<R> {
    fn is_header(&self, record: &CsvRecord) -> bool {
        // ---
        let declared = self
            .headers
            .iter()
            .enumerate()
            .filter_map(|(i, h)| h.as_deref().map(|h| (i, h)))
            .collect::<Vec<_>>();
        let matches_signature = !declared.is_empty()
            && declared
                .iter()
                .all(|(i, h)| record.fields.get(*i).map(|f| f.trim()) == Some(*h));
        if matches_signature {
            return true;
        }
        // A sniffed header only counts when its timestamp does not parse.
        self.sniffed_header
            && self
                .parsers
                .first()
                .is_some_and(|p| p.parse(&record.fields).is_err())
    }

    fn parse_record(&self, record: CsvRecord) -> Row {
        // ---
        let mut columns = Vec::with_capacity(self.parsers.len());
        let mut errors = Vec::new();
        for (index, parser) in self.parsers.iter().enumerate() {
            match parser.parse(&record.fields) {
                Ok(value) => columns.push(value),
                Err(error) => {
                    tracing::debug!(
                        file = %self.file_key,
                        line = record.line_num,
                        column = index,
                        %error,
                        "row error"
                    );
                    columns.push(None);
                    errors.push(RowError {
                        line_num: record.line_num,
                        source_columns: parser.source_columns(),
                        index,
                        error,
                    });
                }
            }
        }
        Row {
            line_num: record.line_num,
            byte_position: record.byte_position,
            columns,
            errors,
        }
    }
}

impl<R: Read> Iterator for Rows<R> {
    type Item = Result<Row, IngestError>;

    fn next(&mut self) -> Option<Self::Item> {
        // ---
        loop {
            let record = match self.records.next()? {
                Ok(record) => record,
                Err(source) => {
                    return Some(Err(IngestError::Parse {
                        file: self.file_key.clone(),
                        source,
                    }))
                }
            };
            if std::mem::take(&mut self.first) && self.is_header(&record) {
                continue;
            }
            return Some(Ok(self.parse_record(record)));
        }
    }
}

/// Set up ingestion of one file: sniff it, resolve its columns and build
/// one parser per output column.
pub fn open_file<R: Read + Seek>(
    map: &SensorMap,
    file_key: &str,
    stream: R,
    catalog: &Catalog,
    options: &SnifferOptions,
) -> Result<FileIngest<R>, IngestError> {
    // ---
    let spec = map
        .files
        .get(file_key)
        .ok_or_else(|| IngestError::UnknownFile(file_key.to_string()))?;
    let sensors: Vec<_> = map.sensors_for_file(file_key).collect();

    // Every sensor of a file shares the file's timestamps, so the first
    // sensor's site decides how they are read.
    let timezone = match sensors.first() {
        Some((path, _)) => map.timezone(path).map_err(|message| IngestError::Timezone {
            file: file_key.to_string(),
            message,
        })?,
        None => chrono_tz::Tz::UTC,
    };

    let schema_error = |message: String| {
        IngestError::Schema(SchemaErrors::single(
            vec!["files".into(), file_key.into()],
            message,
        ))
    };

    let ts_columns = spec
        .timestamp
        .columns
        .iter()
        .map(|c| {
            spec.resolve_column(c)
                .ok_or_else(|| schema_error(format!("timestamp column {c} does not resolve")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let mut parsers = vec![ColumnParser::Datetime(DatetimeParser {
        columns: ts_columns,
        separator: spec.timestamp.separator.clone(),
        formats: spec.timestamp.format.iter().cloned().collect(),
        timezone,
        default: None,
    })];
    let mut sensor_names = vec![None];

    for (path, node) in &sensors {
        let column = spec
            .resolve_column(&node.column)
            .ok_or_else(|| schema_error(format!("sensor {path} column {} does not resolve", node.column)))?;
        let def = catalog
            .sensor_type(&node.sensor_type)
            .ok_or_else(|| schema_error(format!("sensor {path} has unknown type {}", node.sensor_type)))?;
        let bounds = catalog.bounds(&node.sensor_type, node.unit.as_deref());
        parsers.push(ColumnParser::for_sensor(def.storage_type, column, bounds, timezone));
        sensor_names.push(Some(path.to_string()));
    }

    let csv = CsvFile::open(stream, options).map_err(|source| IngestError::Parse {
        file: file_key.to_string(),
        source,
    })?;
    let size = csv.size();
    let sniffed_header = csv.dialect().has_header;

    Ok(FileIngest {
        file_key: file_key.to_string(),
        size,
        types: parsers.iter().map(ColumnParser::storage_type).collect(),
        sensor_names,
        rows: Rows {
            file_key: file_key.to_string(),
            records: csv.records(),
            parsers,
            headers: spec.signature.headers.clone(),
            sniffed_header,
            first: true,
        },
    })
}

/// Files of an ingest, opened one at a time as the caller pulls.
pub struct IngestFiles<'a, R> {
    map: &'a SensorMap,
    catalog: &'a Catalog,
    options: SnifferOptions,
    pending: VecDeque<(String, Option<R>)>,
}

impl<R: Read + Seek> Iterator for IngestFiles<'_, R> {
    type Item = Result<FileIngest<R>, IngestError>;

    fn next(&mut self) -> Option<Self::Item> {
        // ---
        let (file_key, stream) = self.pending.pop_front()?;
        Some(match stream {
            None => Err(IngestError::MissingFile(file_key)),
            Some(stream) if self.map.files.contains_key(&file_key) => {
                open_file(self.map, &file_key, stream, self.catalog, &self.options)
            }
            Some(_) => Err(IngestError::UnknownFile(file_key)),
        })
    }
}

/// Validate `map` and prepare ingestion of `files` (file key to stream).
/// Declared files come first in map order, then any stray uploads.
pub fn ingest_files<'a, R: Read + Seek>(
    map: &'a SensorMap,
    mut files: IndexMap<String, R>,
    catalog: &'a Catalog,
    options: &SnifferOptions,
) -> Result<IngestFiles<'a, R>, IngestError> {
    // ---
    let doc = serde_json::to_value(map)
        .map_err(|e| SchemaErrors::single(Vec::new(), e.to_string()))?;
    let errors = validate(&doc, catalog);
    if !errors.is_empty() {
        return Err(IngestError::Schema(errors));
    }

    let mut pending: VecDeque<(String, Option<R>)> = map
        .files
        .keys()
        .map(|key| (key.clone(), files.shift_remove(key)))
        .collect();
    pending.extend(files.into_iter().map(|(key, stream)| (key, Some(stream))));

    Ok(IngestFiles {
        map,
        catalog,
        options: options.clone(),
        pending,
    })
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::io::Cursor;

    fn map(headers: serde_json::Value) -> SensorMap {
        let doc = serde_json::json!({
            "version": 1,
            "files": {
                "0": {
                    "signature": {"headers": headers},
                    "timestamp": {"columns": ["Date"], "format": "%m/%d/%Y %H:%M"}
                }
            },
            "sensors": {
                "Site": {"level": "site"},
                "Site/OAT": {"type": "OutdoorAirTemperature", "unit": "fahrenheit", "file": "0", "column": "OAT"}
            }
        });
        SensorMap::from_value(doc, Catalog::builtin()).unwrap()
    }

    fn files(text: &str) -> IndexMap<String, Cursor<Vec<u8>>> {
        IndexMap::from([("0".to_string(), Cursor::new(text.as_bytes().to_vec()))])
    }

    fn rows(map: &SensorMap, text: &str) -> Vec<Row> {
        let mut ingest = ingest_files(map, files(text), Catalog::builtin(), &SnifferOptions::default()).unwrap();
        let file = ingest.next().unwrap().unwrap();
        assert!(ingest.next().is_none());
        file.rows.collect::<Result<Vec<_>, _>>().unwrap()
    }

    #[test]
    fn test_file_metadata() {
        // ---
        let map = map(serde_json::json!(["Date", "OAT"]));
        let text = "09/29/2009 15:00,74.72\n";
        let mut ingest = ingest_files(&map, files(text), Catalog::builtin(), &SnifferOptions::default()).unwrap();
        let file = ingest.next().unwrap().unwrap();
        assert_eq!(file.file_key, "0");
        assert_eq!(file.size, text.len() as u64);
        assert_eq!(file.sensor_names, vec![None, Some("Site/OAT".to_string())]);
        assert_eq!(file.types, vec![StorageType::Datetime, StorageType::Float]);
    }

    #[test]
    fn test_rows_are_typed() {
        // ---
        let map = map(serde_json::json!(["Date", "OAT"]));
        let rows = rows(&map, "09/29/2009 15:00,74.72\n09/29/2009 16:00,75.52\n");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].line_num, 1);
        assert_eq!(rows[1].line_num, 2);
        assert_eq!(
            rows[0].columns,
            vec![
                Some(Value::Datetime(Utc.with_ymd_and_hms(2009, 9, 29, 15, 0, 0).unwrap())),
                Some(Value::Float(74.72)),
            ]
        );
        assert!(rows.iter().all(Row::is_clean));
    }

    #[test]
    fn test_signature_header_is_skipped() {
        // ---
        let map = map(serde_json::json!(["Date", "OAT"]));
        let rows = rows(&map, "Date,OAT\n09/29/2009 15:00,74.72\n");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].line_num, 2);
    }

    #[test]
    fn test_row_errors_keep_going() {
        // ---
        let map = map(serde_json::json!(["Date", "OAT"]));
        let rows = rows(&map, "09/29/2009 15:00,9999\nnot a date,70\n09/29/2009 17:00,71\n");
        assert_eq!(rows.len(), 3);

        assert_eq!(rows[0].columns[1], None);
        assert_eq!(rows[0].errors.len(), 1);
        assert_eq!(rows[0].errors[0].index, 1);
        assert_eq!(rows[0].errors[0].source_columns, vec![1]);
        assert!(rows[0].errors[0].error.is_out_of_range());

        assert_eq!(rows[1].columns[0], None);
        assert_eq!(rows[1].errors[0].index, 0);
        assert_eq!(rows[1].columns[1], Some(Value::Float(70.0)));

        assert!(rows[2].is_clean());
    }

    #[test]
    fn test_missing_upload_is_reported() {
        // ---
        let map = map(serde_json::json!(["Date", "OAT"]));
        let mut ingest = ingest_files(
            &map,
            IndexMap::<String, Cursor<Vec<u8>>>::new(),
            Catalog::builtin(),
            &SnifferOptions::default(),
        )
        .unwrap();
        assert!(matches!(ingest.next(), Some(Err(IngestError::MissingFile(key))) if key == "0"));
    }

    #[test]
    fn test_line_too_long_aborts_file() {
        // ---
        let map = map(serde_json::json!(["Date", "OAT"]));
        let options = SnifferOptions {
            max_line_size: 30,
            ..SnifferOptions::default()
        };
        let text = format!("09/29/2009 15:00,74.72\n09/29/2009 16:00,{}\n", "7".repeat(40));
        let mut ingest = ingest_files(&map, files(&text), Catalog::builtin(), &options).unwrap();
        let results: Vec<_> = ingest.next().unwrap().unwrap().rows.collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(matches!(
            &results[1],
            Err(IngestError::Parse {
                source: ParseError::LineTooLong { line: 2, .. },
                ..
            })
        ));
    }
}
