//! User-configured filter chains over the sensors of a dataset.
//!
//! Each sensor gets a plan: the stored column it reads plus the filters
//! stacked on it. Configuration entries either extend a sensor's plan in
//! place or derive a new sensor under an `output` path. Plans are only
//! executed when a series is requested or the pipeline is committed into
//! a new sensor map and dataset.

use std::collections::{BTreeSet, HashMap};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::Catalog;
use crate::models::{IngestId, SensorMapId, StorageType};
use crate::sensormap::{SensorMapNode, SensorNode};
use crate::store::{DataStore, IngestStatus, SensorRecord};
use crate::timeseries::{QueryError, TimeSeries};

use super::Filter;

// ---

/// One configuration entry: apply `filter` to `on` (a sensor path or a
/// group path covering every sensor beneath it).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterEntry {
    pub on: String,
    pub filter: String,
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
    /// Derive a new sensor at this path instead of replacing `on`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("filter entry {index} on {on}: {message}")]
pub struct FilterConfigError {
    pub index: usize,
    pub on: String,
    pub message: String,
}

/// A stored source column plus the filters applied to it, in order.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorPlan {
    pub source: SensorRecord,
    pub steps: Vec<Filter>,
    /// Map node the derived sensor is registered under on commit.
    pub node: SensorNode,
}

impl SensorPlan {
    pub fn output_type(&self) -> StorageType {
        self.steps
            .iter()
            .fold(self.source.storage_type, |st, f| f.output_type(st))
    }
}

#[derive(Debug, Clone)]
pub struct FilterPipeline {
    map_id: SensorMapId,
    ingests: Vec<IngestId>,
    plans: IndexMap<String, SensorPlan>,
    errors: Vec<FilterConfigError>,
}

impl FilterPipeline {
    /// Resolve `entries` against the sensors of `map_id`. Entries that fail
    /// are reported in [`FilterPipeline::errors`]; the rest still apply
    /// unless they read from a failed entry's output.
    pub fn build(
        store: &DataStore,
        map_id: SensorMapId,
        ingests: Vec<IngestId>,
        entries: &[FilterEntry],
    ) -> Result<FilterPipeline, QueryError> {
        // ---
        let map = store.sensor_map(map_id)?.map;
        let mut plans = IndexMap::new();
        for sensor in store.sensors(map_id) {
            let node = map
                .sensor(&sensor.path)
                .cloned()
                .ok_or_else(|| QueryError::MissingSensor(sensor.path.clone()))?;
            plans.insert(
                sensor.path.clone(),
                SensorPlan {
                    source: sensor,
                    steps: Vec::new(),
                    node,
                },
            );
        }

        let mut pipeline = FilterPipeline {
            map_id,
            ingests,
            plans,
            errors: Vec::new(),
        };
        let mut failed_outputs = BTreeSet::new();
        for (index, entry) in entries.iter().enumerate() {
            if let Err(message) = pipeline.apply_entry(entry, &failed_outputs) {
                tracing::warn!(index, on = %entry.on, %message, "filter entry rejected");
                if let Some(output) = &entry.output {
                    failed_outputs.insert(output.clone());
                }
                pipeline.errors.push(FilterConfigError {
                    index,
                    on: entry.on.clone(),
                    message,
                });
            }
        }
        Ok(pipeline)
    }

    fn targets(&self, on: &str) -> Vec<String> {
        // ---
        if self.plans.contains_key(on) {
            return vec![on.to_string()];
        }
        let prefix = format!("{on}/");
        self.plans
            .keys()
            .filter(|path| path.starts_with(&prefix))
            .cloned()
            .collect()
    }

    fn apply_entry(&mut self, entry: &FilterEntry, failed_outputs: &BTreeSet<String>) -> Result<(), String> {
        // ---
        if failed_outputs.contains(&entry.on) {
            return Err(format!("reads {} which an earlier failed entry should have produced", entry.on));
        }
        let filter = Filter::from_config(&entry.filter, &entry.params)?;
        let targets = self.targets(&entry.on);
        if targets.is_empty() {
            return Err("no sensor or group with this path".to_string());
        }
        for target in &targets {
            let input = self.plans[target].output_type();
            if !filter.accepts(input) {
                return Err(format!("{} cannot be applied to {input} sensor {target}", entry.filter));
            }
        }

        match &entry.output {
            None => {
                for target in targets {
                    if let Some(plan) = self.plans.get_mut(&target) {
                        plan.steps.push(filter.clone());
                    }
                }
            }
            Some(output) => {
                if targets.len() != 1 {
                    return Err("output needs a single sensor to read from".to_string());
                }
                if output.is_empty() || output.split('/').any(str::is_empty) {
                    return Err(format!("output path {output:?} is not a valid sensor path"));
                }
                if self.plans.contains_key(output) {
                    return Err(format!("output path {output} already exists"));
                }
                let mut plan = self.plans[&targets[0]].clone();
                plan.steps.push(filter);
                self.plans.insert(output.clone(), plan);
            }
        }
        Ok(())
    }

    pub fn errors(&self) -> &[FilterConfigError] {
        &self.errors
    }

    pub fn plans(&self) -> &IndexMap<String, SensorPlan> {
        &self.plans
    }

    /// Filtered series for `path` over the pipeline's datasets.
    pub fn series(&self, store: &DataStore, path: &str) -> Result<TimeSeries, QueryError> {
        let ingests = (!self.ingests.is_empty()).then_some(self.ingests.as_slice());
        self.series_within(store, path, ingests)
    }

    /// Filtered series for `path` over `ingests` (`None` for every complete
    /// dataset of the map).
    pub fn series_within(
        &self,
        store: &DataStore,
        path: &str,
        ingests: Option<&[IngestId]>,
    ) -> Result<TimeSeries, QueryError> {
        // ---
        let plan = self
            .plans
            .get(path)
            .ok_or_else(|| QueryError::MissingSensor(path.to_string()))?;
        let mut series = store.query(plan.source.id, ingests)?.into_series();
        for step in &plan.steps {
            series = step.apply(series);
        }
        Ok(series)
    }

    /// Write every plan's output into a new sensor map and dataset. Values
    /// are converted to each sensor's storage type; the source dataset is
    /// left untouched.
    pub fn commit(&self, store: &DataStore, catalog: &Catalog, name: &str) -> Result<(SensorMapId, IngestId), QueryError> {
        // ---
        let source = store.sensor_map(self.map_id)?;
        let mut map = source.map.clone();
        for (path, plan) in &self.plans {
            if !map.sensors.contains_key(path) {
                map.sensors
                    .insert(path.clone(), SensorMapNode::Sensor(plan.node.clone()));
            }
        }

        let map_id = store.create_sensor_map(source.project, name, map, catalog)?;
        let mut files = IndexMap::new();
        for ingest in store.ingests(self.map_id) {
            if self.ingests.is_empty() || self.ingests.contains(&ingest.id) {
                files.extend(ingest.files);
            }
        }
        let ingest_id = store.create_ingest(map_id, name, files)?;
        store.set_ingest_status(ingest_id, IngestStatus::Running)?;

        let sensors: HashMap<String, SensorRecord> = store
            .sensors(map_id)
            .into_iter()
            .map(|s| (s.path.clone(), s))
            .collect();
        let written = self.write_plans(store, ingest_id, &sensors);
        match written {
            Ok(count) => {
                store.set_ingest_status(ingest_id, IngestStatus::Complete)?;
                tracing::info!(sensor_map = %map_id, ingest = %ingest_id, values = count, "committed filtered dataset");
                Ok((map_id, ingest_id))
            }
            Err(e) => {
                store.set_ingest_status(ingest_id, IngestStatus::Error)?;
                Err(e)
            }
        }
    }

    fn write_plans(
        &self,
        store: &DataStore,
        ingest_id: IngestId,
        sensors: &HashMap<String, SensorRecord>,
    ) -> Result<usize, QueryError> {
        // ---
        let mut count = 0;
        for path in self.plans.keys() {
            let target = sensors
                .get(path)
                .ok_or_else(|| QueryError::MissingSensor(path.clone()))?;
            let mut samples = Vec::new();
            for sample in self.series(store, path)? {
                let (t, v) = sample?;
                match v.clone().coerce(target.storage_type) {
                    Some(v) => samples.push((t, v)),
                    None => tracing::warn!(sensor = %path, value = %v, "dropping value of the wrong type"),
                }
            }
            count += store.append(ingest_id, target.id, samples)?;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::models::{ProjectId, Timestamp, Value};
    use crate::sensormap::SensorMap;
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;
    use std::sync::Arc;

    fn at(m: i64) -> Timestamp {
        Utc.with_ymd_and_hms(2014, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(m)
    }

    fn setup() -> (Arc<DataStore>, SensorMapId, IngestId) {
        let doc = json!({
            "version": 1,
            "files": {
                "0": {"signature": {"headers": ["Date", "OAT", "Mode"]}, "timestamp": {"columns": [0]}}
            },
            "sensors": {
                "Site": {"level": "site"},
                "Site/OAT": {"type": "OutdoorAirTemperature", "unit": "fahrenheit", "file": "0", "column": 1},
                "Site/Mode": {"type": "OperatingMode", "unit": null, "file": "0", "column": 2}
            }
        });
        let map = SensorMap::from_value(doc, Catalog::builtin()).unwrap();
        let store = DataStore::new();
        let map_id = store
            .create_sensor_map(ProjectId::new(1), "m", map, Catalog::builtin())
            .unwrap();
        let ingest = store
            .create_ingest(map_id, "i", IndexMap::from([("0".to_string(), "a.csv".to_string())]))
            .unwrap();
        let oat = store.sensor_by_path(map_id, "Site/OAT").unwrap();
        store
            .append(
                ingest,
                oat.id,
                vec![(at(0), Value::Float(10.123)), (at(20), Value::Float(30.456))],
            )
            .unwrap();
        let mode = store.sensor_by_path(map_id, "Site/Mode").unwrap();
        store
            .append(ingest, mode.id, vec![(at(0), Value::from("heat"))])
            .unwrap();
        store.set_ingest_status(ingest, IngestStatus::Complete).unwrap();
        (store, map_id, ingest)
    }

    fn entry(value: serde_json::Value) -> FilterEntry {
        serde_json::from_value(value).unwrap()
    }

    fn values(pipeline: &FilterPipeline, store: &DataStore, path: &str) -> Vec<Value> {
        pipeline
            .series(store, path)
            .unwrap()
            .map(|s| s.unwrap().1)
            .collect()
    }

    #[test]
    fn test_replace_in_place() {
        // ---
        let (store, map_id, ingest) = setup();
        let entries = vec![entry(json!({"on": "Site/OAT", "filter": "round", "params": {"places": 1}}))];
        let pipeline = FilterPipeline::build(&store, map_id, vec![ingest], &entries).unwrap();
        assert!(pipeline.errors().is_empty());
        assert_eq!(
            values(&pipeline, &store, "Site/OAT"),
            vec![Value::Float(10.1), Value::Float(30.5)]
        );
    }

    #[test]
    fn test_derive_new_sensor() {
        // ---
        let (store, map_id, ingest) = setup();
        let entries = vec![entry(json!({
            "on": "Site/OAT",
            "filter": "linear_interpolation",
            "params": {"period_seconds": 600},
            "output": "Site/OAT_10min"
        }))];
        let pipeline = FilterPipeline::build(&store, map_id, vec![ingest], &entries).unwrap();
        assert_eq!(values(&pipeline, &store, "Site/OAT_10min").len(), 3);
        assert_eq!(values(&pipeline, &store, "Site/OAT").len(), 2);
    }

    #[test]
    fn test_config_errors_are_collected() {
        // ---
        let (store, map_id, ingest) = setup();
        let entries = vec![
            entry(json!({"on": "Site/Nope", "filter": "round"})),
            entry(json!({"on": "Site/Mode", "filter": "scale", "params": {"factor": 2}})),
            entry(json!({"on": "Site/OAT", "filter": "sum", "output": "Site/Total"})),
            entry(json!({"on": "Site/Total", "filter": "round"})),
            entry(json!({"on": "Site", "filter": "fill", "params": {"period_seconds": 300}})),
        ];
        let pipeline = FilterPipeline::build(&store, map_id, vec![ingest], &entries).unwrap();
        let failed: Vec<usize> = pipeline.errors().iter().map(|e| e.index).collect();
        assert_eq!(failed, vec![0, 1, 2, 3]);
        assert!(pipeline.errors()[3].message.contains("earlier failed entry"));
        assert_eq!(pipeline.plans()["Site/OAT"].steps.len(), 1);
        assert_eq!(pipeline.plans()["Site/Mode"].steps.len(), 1);
    }

    #[test]
    fn test_commit_creates_new_dataset() {
        // ---
        let (store, map_id, ingest) = setup();
        let entries = vec![entry(json!({
            "on": "Site/OAT",
            "filter": "scale",
            "params": {"factor": 2.0},
            "output": "Site/OAT2"
        }))];
        let pipeline = FilterPipeline::build(&store, map_id, vec![ingest], &entries).unwrap();
        let (new_map, new_ingest) = pipeline.commit(&store, Catalog::builtin(), "filtered").unwrap();

        assert_ne!(new_map, map_id);
        assert_eq!(store.ingest(new_ingest).unwrap().status, IngestStatus::Complete);
        let derived = store.sensor_by_path(new_map, "Site/OAT2").unwrap();
        let column: Vec<Value> = store.column(derived.id, None).unwrap().into_iter().map(|(_, v)| v).collect();
        assert_eq!(column, vec![Value::Float(20.246), Value::Float(60.912)]);

        // The source dataset is not touched.
        let oat = store.sensor_by_path(map_id, "Site/OAT").unwrap();
        assert_eq!(store.column(oat.id, None).unwrap().len(), 2);
        assert!(store.sensor_by_path(map_id, "Site/OAT2").is_none());
    }
}
