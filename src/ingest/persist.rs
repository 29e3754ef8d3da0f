//! Drive an ingest into the column store.

use std::collections::HashMap;
use std::io::{Read, Seek};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;

use crate::catalog::Catalog;
use crate::models::{IngestId, SensorId};
use crate::sniffer::SnifferOptions;
use crate::store::{DataStore, IngestLog, IngestLogEntry, IngestStatus};
use crate::timeseries::Sample;

use super::{ingest_files, FileIngest, IngestError};

/// Cooperative cancellation flag, checked between rows.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl IngestError {
    /// File the error belongs to, if it is a per-file error.
    pub fn file(&self) -> Option<&str> {
        match self {
            IngestError::Parse { file, .. }
            | IngestError::Timezone { file, .. }
            | IngestError::Cancelled { file, .. } => Some(file),
            IngestError::MissingFile(file) | IngestError::UnknownFile(file) => Some(file),
            IngestError::Schema(_) | IngestError::Store(_) => None,
        }
    }
}

// ---

enum FileOutcome {
    Stored,
    Failed(IngestError),
}

/// Parse one file fully and append its clean values. Nothing from the
/// file is stored if it fails part way through.
fn ingest_one<R: Read>(
    store: &DataStore,
    ingest_id: IngestId,
    file: FileIngest<R>,
    sensors: &HashMap<String, SensorId>,
    log: &mut IngestLog,
    cancel: &CancelToken,
) -> Result<FileOutcome, IngestError> {
    // ---
    let FileIngest {
        file_key,
        sensor_names,
        rows,
        ..
    } = file;
    let mut columns: Vec<Vec<Sample>> = vec![Vec::new(); sensor_names.len()];
    let mut rows_seen = 0u64;
    let mut rows_with_errors = 0u64;
    let mut entries = Vec::new();

    for row in rows {
        let row = match row {
            Ok(row) => row,
            Err(e) => return Ok(FileOutcome::Failed(e)),
        };
        if cancel.is_cancelled() {
            return Err(IngestError::Cancelled {
                file: file_key,
                line: row.line_num,
            });
        }

        rows_seen += 1;
        let clean = row.is_clean();
        for error in &row.errors {
            entries.push(IngestLogEntry {
                file: file_key.clone(),
                line: error.line_num,
                columns: error.source_columns.clone(),
                message: error.error.to_string(),
            });
        }

        let timestamp = row.columns.first().and_then(|v| v.as_ref()).and_then(|v| v.as_timestamp());
        let Some(time) = timestamp else {
            if row.errors.iter().all(|e| e.index != 0) {
                entries.push(IngestLogEntry {
                    file: file_key.clone(),
                    line: row.line_num,
                    columns: Vec::new(),
                    message: "row has no timestamp".to_string(),
                });
            }
            rows_with_errors += 1;
            continue;
        };

        for (slot, value) in row.columns.into_iter().enumerate().skip(1) {
            if let Some(value) = value {
                columns[slot].push((time, value));
            }
        }
        if !clean {
            rows_with_errors += 1;
        }
    }

    let mut stored = 0u64;
    for (slot, samples) in columns.into_iter().enumerate() {
        let Some(path) = &sensor_names[slot] else {
            continue;
        };
        let Some(&sensor) = sensors.get(path) else {
            continue;
        };
        stored += store.append(ingest_id, sensor, samples)? as u64;
    }

    tracing::info!(
        ingest = %ingest_id,
        file = %file_key,
        rows = rows_seen,
        rows_with_errors,
        values = stored,
        "ingested file"
    );
    log.rows += rows_seen;
    log.rows_with_errors += rows_with_errors;
    log.values_stored += stored;
    log.entries.extend(entries);
    Ok(FileOutcome::Stored)
}

/// Ingest `files` into the queued dataset `ingest_id`.
///
/// Row errors are logged and skipped. A file that cannot be read is
/// recorded in the log and left out while the other files continue. The
/// dataset ends `complete` unless it was cancelled or no file could be
/// stored, in which case it ends `error` and stays invisible to queries.
pub fn run_ingest<R: Read + Seek>(
    store: &DataStore,
    ingest_id: IngestId,
    files: IndexMap<String, R>,
    catalog: &Catalog,
    options: &SnifferOptions,
    cancel: &CancelToken,
) -> Result<IngestLog, IngestError> {
    // ---
    let record = store.ingest(ingest_id)?;
    let map = store.sensor_map(record.map_id)?.map;
    let sensors: HashMap<String, SensorId> = store
        .sensors(record.map_id)
        .into_iter()
        .map(|s| (s.path, s.id))
        .collect();

    store.set_ingest_status(ingest_id, IngestStatus::Running)?;
    let mut log = IngestLog::default();

    let pending = match ingest_files(&map, files, catalog, options) {
        Ok(pending) => pending,
        Err(e) => {
            tracing::error!(ingest = %ingest_id, error = %e, "ingest rejected");
            store.set_ingest_status(ingest_id, IngestStatus::Error)?;
            return Err(e);
        }
    };

    let mut attempted = 0usize;
    for file in pending {
        attempted += 1;
        let outcome = match file {
            Ok(file) => match ingest_one(store, ingest_id, file, &sensors, &mut log, cancel) {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(ingest = %ingest_id, error = %e, "ingest aborted");
                    store.set_ingest_log(ingest_id, log)?;
                    store.set_ingest_status(ingest_id, IngestStatus::Error)?;
                    return Err(e);
                }
            },
            Err(e) => FileOutcome::Failed(e),
        };
        if let FileOutcome::Failed(e) = outcome {
            let file = e.file().unwrap_or_default().to_string();
            tracing::error!(ingest = %ingest_id, %file, error = %e, "file failed");
            log.file_errors.insert(file, e.to_string());
        }
    }

    let status = if attempted > 0 && log.file_errors.len() == attempted {
        IngestStatus::Error
    } else {
        IngestStatus::Complete
    };
    store.set_ingest_log(ingest_id, log.clone())?;
    store.set_ingest_status(ingest_id, status)?;
    Ok(log)
}
