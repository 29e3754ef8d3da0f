//! In-process sensor column store.
//!
//! Holds sensor maps, their sensors, datasets (ingests) and the five
//! per-type data tables. Every sensor lives in exactly one table chosen by
//! its storage type. Rows of a dataset only become visible to queries once
//! the dataset is complete.
//!
//! The store is shared behind an `Arc` and guarded by a single
//! `parking_lot::RwLock`: ingestion appends under the write lock, queries
//! snapshot a column under the read lock and iterate without holding it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use chrono_tz::Tz;
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;

use crate::catalog::Catalog;
use crate::models::{IngestId, ProjectId, SensorId, SensorMapId, StorageType, Timestamp};
use crate::sensormap::{SchemaErrors, SensorMap};
use crate::timeseries::{QueryError, Sample};

mod query;

pub use query::{Field, Lookup, OrderBy, Predicate, SensorQuery, SeriesResult};

// ---

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sensor map {0} does not exist")]
    UnknownSensorMap(SensorMapId),

    #[error("sensor {0} does not exist")]
    UnknownSensor(SensorId),

    #[error("ingest {0} does not exist")]
    UnknownIngest(IngestId),

    #[error("sensor map is invalid: {0}")]
    InvalidMap(#[from] SchemaErrors),

    #[error("sensor {path} has unknown type {sensor_type}")]
    UnknownSensorType { path: String, sensor_type: String },

    #[error("sensor {path}: {message}")]
    Timezone { path: String, message: String },

    #[error("sensor {path} stores {expected} values, got {found}")]
    TypeMismatch {
        path: String,
        expected: StorageType,
        found: StorageType,
    },
}

impl From<StoreError> for QueryError {
    fn from(e: StoreError) -> Self {
        QueryError::Store(e.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct SensorMapRecord {
    pub id: SensorMapId,
    pub project: ProjectId,
    pub name: String,
    pub map: SensorMap,
    pub created: Timestamp,
}

/// A sensor column as resolved from its map node at registration time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorRecord {
    pub id: SensorId,
    pub map_id: SensorMapId,
    pub path: String,
    pub sensor_type: String,
    pub unit: Option<String>,
    pub storage_type: StorageType,
    #[serde(serialize_with = "serialize_tz")]
    pub timezone: Tz,
}

fn serialize_tz<S: serde::Serializer>(tz: &Tz, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(tz.name())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestStatus {
    Queued,
    Running,
    Complete,
    Error,
}

impl std::fmt::Display for IngestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            IngestStatus::Queued => "queued",
            IngestStatus::Running => "running",
            IngestStatus::Complete => "complete",
            IngestStatus::Error => "error",
        };
        f.write_str(name)
    }
}

/// One row-level problem recorded while ingesting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestLogEntry {
    pub file: String,
    pub line: u64,
    pub columns: Vec<usize>,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngestLog {
    pub rows: u64,
    pub rows_with_errors: u64,
    pub values_stored: u64,
    pub entries: Vec<IngestLogEntry>,
    /// Fatal per-file errors, keyed by file key.
    pub file_errors: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct IngestRecord {
    pub id: IngestId,
    pub map_id: SensorMapId,
    pub name: String,
    /// File key to uploaded file name.
    pub files: IndexMap<String, String>,
    pub status: IngestStatus,
    pub created: Timestamp,
    pub ended: Option<Timestamp>,
    pub log: IngestLog,
}

#[derive(Debug, Clone)]
struct StoredRow {
    ingest: IngestId,
    sample: Sample,
}

/// One per-type data table.
#[derive(Debug, Default)]
struct TypedTable {
    columns: HashMap<SensorId, Vec<StoredRow>>,
}

#[derive(Debug, Default)]
struct StoreInner {
    next_map_id: i64,
    next_sensor_id: i64,
    maps: BTreeMap<SensorMapId, SensorMapRecord>,
    sensors: BTreeMap<SensorId, SensorRecord>,
    ingests: IndexMap<IngestId, IngestRecord>,
    tables: BTreeMap<StorageType, TypedTable>,
}

impl StoreInner {
    fn table_mut(&mut self, storage_type: StorageType) -> &mut TypedTable {
        self.tables.entry(storage_type).or_default()
    }

    fn remove_ingest_rows(&mut self, ingest: IngestId) {
        for table in self.tables.values_mut() {
            for rows in table.columns.values_mut() {
                rows.retain(|r| r.ingest != ingest);
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct DataStore {
    inner: RwLock<StoreInner>,
}

impl DataStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a validated sensor map and create one sensor per sensor node.
    pub fn create_sensor_map(
        &self,
        project: ProjectId,
        name: &str,
        map: SensorMap,
        catalog: &Catalog,
    ) -> Result<SensorMapId, StoreError> {
        // ---
        let errors = map.validate(catalog);
        if !errors.is_empty() {
            return Err(StoreError::InvalidMap(errors));
        }

        let mut resolved = Vec::new();
        for (path, node) in map.sensor_nodes() {
            let def = catalog
                .sensor_type(&node.sensor_type)
                .ok_or_else(|| StoreError::UnknownSensorType {
                    path: path.to_string(),
                    sensor_type: node.sensor_type.clone(),
                })?;
            let timezone = map.timezone(path).map_err(|message| StoreError::Timezone {
                path: path.to_string(),
                message,
            })?;
            resolved.push((path.to_string(), node.clone(), def.storage_type, timezone));
        }

        let mut inner = self.inner.write();
        inner.next_map_id += 1;
        let id = SensorMapId::new(inner.next_map_id);

        for (path, node, storage_type, timezone) in resolved {
            inner.next_sensor_id += 1;
            let sensor_id = SensorId::new(inner.next_sensor_id);
            inner.sensors.insert(
                sensor_id,
                SensorRecord {
                    id: sensor_id,
                    map_id: id,
                    path,
                    sensor_type: node.sensor_type,
                    unit: node.unit,
                    storage_type,
                    timezone,
                },
            );
        }
        inner.maps.insert(
            id,
            SensorMapRecord {
                id,
                project,
                name: name.to_string(),
                map,
                created: Utc::now(),
            },
        );

        tracing::info!(sensor_map = %id, name, "created sensor map");
        Ok(id)
    }

    pub fn sensor_map(&self, id: SensorMapId) -> Result<SensorMapRecord, StoreError> {
        self.inner
            .read()
            .maps
            .get(&id)
            .cloned()
            .ok_or(StoreError::UnknownSensorMap(id))
    }

    /// Sensors of a map in id order, which is map order.
    pub fn sensors(&self, map_id: SensorMapId) -> Vec<SensorRecord> {
        self.inner
            .read()
            .sensors
            .values()
            .filter(|s| s.map_id == map_id)
            .cloned()
            .collect()
    }

    pub fn sensor(&self, id: SensorId) -> Result<SensorRecord, StoreError> {
        self.inner
            .read()
            .sensors
            .get(&id)
            .cloned()
            .ok_or(StoreError::UnknownSensor(id))
    }

    pub fn sensor_by_path(&self, map_id: SensorMapId, path: &str) -> Option<SensorRecord> {
        self.inner
            .read()
            .sensors
            .values()
            .find(|s| s.map_id == map_id && s.path == path)
            .cloned()
    }

    /// Remove a sensor map with its sensors, datasets and rows.
    pub fn delete_sensor_map(&self, id: SensorMapId) -> Result<(), StoreError> {
        // ---
        let mut inner = self.inner.write();
        if inner.maps.remove(&id).is_none() {
            return Err(StoreError::UnknownSensorMap(id));
        }

        let ingests: Vec<IngestId> = inner
            .ingests
            .values()
            .filter(|i| i.map_id == id)
            .map(|i| i.id)
            .collect();
        for ingest in &ingests {
            inner.ingests.shift_remove(ingest);
        }

        let sensors: Vec<SensorId> = inner
            .sensors
            .values()
            .filter(|s| s.map_id == id)
            .map(|s| s.id)
            .collect();
        for sensor in &sensors {
            inner.sensors.remove(sensor);
            for table in inner.tables.values_mut() {
                table.columns.remove(sensor);
            }
        }

        tracing::info!(
            sensor_map = %id,
            sensors = sensors.len(),
            ingests = ingests.len(),
            "deleted sensor map"
        );
        Ok(())
    }

    /// Create a queued dataset binding `files` (file key to file name).
    pub fn create_ingest(
        &self,
        map_id: SensorMapId,
        name: &str,
        files: IndexMap<String, String>,
    ) -> Result<IngestId, StoreError> {
        // ---
        let mut inner = self.inner.write();
        if !inner.maps.contains_key(&map_id) {
            return Err(StoreError::UnknownSensorMap(map_id));
        }
        let id = IngestId::new();
        inner.ingests.insert(
            id,
            IngestRecord {
                id,
                map_id,
                name: name.to_string(),
                files,
                status: IngestStatus::Queued,
                created: Utc::now(),
                ended: None,
                log: IngestLog::default(),
            },
        );
        Ok(id)
    }

    pub fn ingest(&self, id: IngestId) -> Result<IngestRecord, StoreError> {
        self.inner
            .read()
            .ingests
            .get(&id)
            .cloned()
            .ok_or(StoreError::UnknownIngest(id))
    }

    /// Datasets of a map in creation order.
    pub fn ingests(&self, map_id: SensorMapId) -> Vec<IngestRecord> {
        self.inner
            .read()
            .ingests
            .values()
            .filter(|i| i.map_id == map_id)
            .cloned()
            .collect()
    }

    /// Move a dataset to `status`. Terminal states stamp the end time.
    pub fn set_ingest_status(&self, id: IngestId, status: IngestStatus) -> Result<(), StoreError> {
        // ---
        let mut inner = self.inner.write();
        let record = inner.ingests.get_mut(&id).ok_or(StoreError::UnknownIngest(id))?;
        record.status = status;
        if matches!(status, IngestStatus::Complete | IngestStatus::Error) {
            record.ended = Some(Utc::now());
        }
        tracing::info!(ingest = %id, %status, "ingest status changed");
        Ok(())
    }

    pub fn set_ingest_log(&self, id: IngestId, log: IngestLog) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let record = inner.ingests.get_mut(&id).ok_or(StoreError::UnknownIngest(id))?;
        record.log = log;
        Ok(())
    }

    /// Remove a dataset and its rows. The sensor map is left alone.
    pub fn delete_ingest(&self, id: IngestId) -> Result<(), StoreError> {
        // ---
        let mut inner = self.inner.write();
        if inner.ingests.shift_remove(&id).is_none() {
            return Err(StoreError::UnknownIngest(id));
        }
        inner.remove_ingest_rows(id);
        tracing::info!(ingest = %id, "deleted ingest");
        Ok(())
    }

    /// Append samples for one sensor to a dataset. Values must already be
    /// of the sensor's storage type. Duplicated timestamps are kept.
    pub fn append(&self, ingest: IngestId, sensor: SensorId, samples: Vec<Sample>) -> Result<usize, StoreError> {
        // ---
        let mut inner = self.inner.write();
        if !inner.ingests.contains_key(&ingest) {
            return Err(StoreError::UnknownIngest(ingest));
        }
        let record = inner.sensors.get(&sensor).ok_or(StoreError::UnknownSensor(sensor))?;
        let expected = record.storage_type;
        if let Some((_, bad)) = samples.iter().find(|(_, v)| v.storage_type() != expected) {
            return Err(StoreError::TypeMismatch {
                path: record.path.clone(),
                expected,
                found: bad.storage_type(),
            });
        }

        let count = samples.len();
        inner
            .table_mut(expected)
            .columns
            .entry(sensor)
            .or_default()
            .extend(samples.into_iter().map(|sample| StoredRow { ingest, sample }));
        Ok(count)
    }

    /// Complete datasets among `ingests`, or every complete dataset of the
    /// sensor's map for `None`. An empty list selects nothing.
    fn visible_ingests(inner: &StoreInner, map_id: SensorMapId, ingests: Option<&[IngestId]>) -> Vec<IngestId> {
        // ---
        inner
            .ingests
            .values()
            .filter(|i| i.map_id == map_id && i.status == IngestStatus::Complete)
            .filter(|i| ingests.map_or(true, |ids| ids.contains(&i.id)))
            .map(|i| i.id)
            .collect()
    }

    /// Snapshot of a sensor's rows from complete datasets, in insertion
    /// order.
    pub fn column(&self, sensor: SensorId, ingests: Option<&[IngestId]>) -> Result<Vec<Sample>, StoreError> {
        // ---
        let inner = self.inner.read();
        let record = inner.sensors.get(&sensor).ok_or(StoreError::UnknownSensor(sensor))?;
        let visible = Self::visible_ingests(&inner, record.map_id, ingests);

        let rows = inner
            .tables
            .get(&record.storage_type)
            .and_then(|t| t.columns.get(&sensor));
        Ok(rows
            .map(|rows| {
                rows.iter()
                    .filter(|r| visible.contains(&r.ingest))
                    .map(|r| r.sample.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Number of stored rows per table, counting every dataset.
    pub fn table_counts(&self) -> BTreeMap<&'static str, usize> {
        // ---
        let inner = self.inner.read();
        StorageType::ALL
            .iter()
            .map(|st| {
                let count = inner
                    .tables
                    .get(st)
                    .map_or(0, |t| t.columns.values().map(Vec::len).sum());
                (st.table_name(), count)
            })
            .collect()
    }

    /// Start a query over one sensor's visible rows.
    pub fn query(&self, sensor: SensorId, ingests: Option<&[IngestId]>) -> Result<SensorQuery, StoreError> {
        // ---
        let record = self.sensor(sensor)?;
        let samples = self.column(sensor, ingests)?;
        Ok(SensorQuery::new(record, samples))
    }

    /// Earliest and latest timestamp over the given sensors' visible rows.
    pub fn time_range(
        &self,
        sensors: &[SensorId],
        ingests: Option<&[IngestId]>,
    ) -> Result<Option<(Timestamp, Timestamp)>, StoreError> {
        // ---
        let mut range: Option<(Timestamp, Timestamp)> = None;
        for &sensor in sensors {
            for (t, _) in self.column(sensor, ingests)? {
                range = Some(match range {
                    None => (t, t),
                    Some((lo, hi)) => (lo.min(t), hi.max(t)),
                });
            }
        }
        Ok(range)
    }
}
