//! CSV-backed output sink for the command-line driver.
//!
//! Each table becomes `<dir>/<analysis id>/<table>.csv` with the logical
//! column names as header, and log messages go to `log.csv` beside them.
//! Files are created on the first flush and appended to afterwards.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use indexmap::IndexMap;

use crate::models::{AnalysisId, Timestamp, Value};

use super::{encode_row, FieldSpec, LogLevel, LogRecord, OutputError, OutputRow, OutputSink};

const LOG_FILE: &str = "log.csv";

struct CsvTable {
    fields: FieldSpec,
    pending: Vec<Vec<Option<Value>>>,
    started: bool,
}

// ---

pub struct CsvOutput {
    dir: PathBuf,
    tables: IndexMap<String, CsvTable>,
    logs: Vec<LogRecord>,
    log_started: bool,
}

impl CsvOutput {
    /// Sink writing under `<root>/<analysis>`.
    pub fn new(root: impl AsRef<Path>, analysis: AnalysisId) -> Self {
        Self {
            dir: root.as_ref().join(analysis.to_string()),
            tables: IndexMap::new(),
            logs: Vec::new(),
            log_started: false,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn table_path(&self, table: &str) -> PathBuf {
        self.dir.join(format!("{table}.csv"))
    }

    fn open(&self, path: &Path, started: bool) -> Result<File, OutputError> {
        // ---
        let file = if started {
            OpenOptions::new().append(true).open(path)?
        } else {
            File::create(path)?
        };
        Ok(file)
    }
}

fn cell(value: &Option<Value>) -> String {
    value.as_ref().map(Value::to_string).unwrap_or_default()
}

impl OutputSink for CsvOutput {
    fn create_table(&mut self, name: &str, fields: &FieldSpec) -> Result<(), OutputError> {
        // ---
        if fields.is_empty() {
            return Err(OutputError::EmptyTable(name.to_string()));
        }
        if self.tables.contains_key(name) {
            return Err(OutputError::DuplicateTable(name.to_string()));
        }
        self.tables.insert(
            name.to_string(),
            CsvTable {
                fields: fields.clone(),
                pending: Vec::new(),
                started: false,
            },
        );
        Ok(())
    }

    fn insert_row(&mut self, table: &str, row: OutputRow) -> Result<(), OutputError> {
        // ---
        let entry = self
            .tables
            .get_mut(table)
            .ok_or_else(|| OutputError::UnknownTable(table.to_string()))?;
        let values = encode_row(table, entry.fields.iter().map(|(n, t)| (n.as_str(), *t)), row)?;
        entry.pending.push(values);
        Ok(())
    }

    fn log(&mut self, message: &str, level: LogLevel, timestamp: Option<Timestamp>) {
        let record = LogRecord {
            level,
            message: message.to_string(),
            timestamp,
        };
        record.emit();
        self.logs.push(record);
    }

    fn flush(&mut self) -> Result<(), OutputError> {
        // ---
        fs::create_dir_all(&self.dir)?;

        let names: Vec<String> = self.tables.keys().cloned().collect();
        for name in names {
            let path = self.table_path(&name);
            let Some(table) = self.tables.get(&name) else {
                continue;
            };
            if table.started && table.pending.is_empty() {
                continue;
            }
            let mut writer = ::csv::Writer::from_writer(self.open(&path, table.started)?);
            if !table.started {
                writer.write_record(table.fields.keys())?;
            }
            for values in &table.pending {
                writer.write_record(values.iter().map(cell))?;
            }
            writer.flush()?;

            if let Some(table) = self.tables.get_mut(&name) {
                tracing::debug!(path = %path.display(), rows = table.pending.len(), "wrote output rows");
                table.pending.clear();
                table.started = true;
            }
        }

        if !self.logs.is_empty() || !self.log_started {
            let path = self.dir.join(LOG_FILE);
            let mut writer = ::csv::Writer::from_writer(self.open(&path, self.log_started)?);
            if !self.log_started {
                writer.write_record(["level", "timestamp", "message"])?;
            }
            for record in self.logs.drain(..) {
                let time = record.timestamp.map(|t| t.to_rfc3339()).unwrap_or_default();
                writer.write_record([record.level.to_string(), time, record.message])?;
            }
            writer.flush()?;
            self.log_started = true;
        }
        Ok(())
    }
}
