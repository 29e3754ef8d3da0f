//! OpenEIS core: sensor-data ingestion and query engine.
//!
//! Uploaded CSV files are described by a declarative sensor map
//! ([`sensormap`]), sniffed ([`sniffer`]), parsed into typed values
//! ([`parsers`], [`ingest`]) and appended to a per-type column store
//! ([`store`]). Analyses read the store through an input facade
//! ([`facade`]), optionally filtered ([`filters`]) and merged on timestamp
//! ([`merge`]), and write rows into shared dynamic output tables
//! ([`output`]) under the control of the [`analysis`] driver.

pub mod analysis;
pub mod apps;
pub mod catalog;
pub mod config;
pub mod db;
pub mod facade;
pub mod filters;
pub mod ingest;
pub mod merge;
pub mod models;
pub mod output;
pub mod parsers;
pub mod schema;
pub mod sensormap;
pub mod sniffer;
pub mod store;
pub mod timeseries;

pub use catalog::Catalog;
pub use config::Config;
pub use models::{AnalysisId, IngestId, OutputId, ProjectId, SensorId, SensorMapId, StorageType, Timestamp, Value};
pub use sensormap::{SchemaErrors, SensorMap};
pub use store::DataStore;
pub use timeseries::{Aggregate, QueryError, Sample, TimeSeries, TruncKind};
