//! Analysis input facade.
//!
//! Binds a sensor map, a topic map (`{input group: [sensor paths]}`) and a
//! set of datasets, and hands applications query sets for whole input
//! groups. An optional filter pipeline is consulted first, so topics may
//! name sensors derived by filters.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDateTime;
use indexmap::IndexMap;
use serde::Serialize;

use crate::filters::FilterPipeline;
use crate::merge::ResultGroup;
use crate::models::{IngestId, SensorMapId, StorageType, Timestamp, Value};
use crate::parsers::localize;
use crate::store::{DataStore, IngestStatus, OrderBy, Predicate, SensorQuery, SensorRecord, SeriesResult};
use crate::timeseries::{Aggregate, QueryError, TimeSeries, TruncKind};

/// `{input group: [sensor paths]}`.
pub type TopicMap = IndexMap<String, Vec<String>>;

// ---

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorMeta {
    pub sensor_type: String,
    pub unit: Option<String>,
    pub timezone: String,
    pub storage_type: StorageType,
}

#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub order_by: OrderBy,
    pub filter: Vec<Predicate>,
    pub exclude: Vec<Predicate>,
    pub wrap_for_merge: bool,
    pub group_by: Option<TruncKind>,
    pub group_by_aggregation: Aggregate,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            order_by: OrderBy::Time,
            filter: Vec::new(),
            exclude: Vec::new(),
            wrap_for_merge: false,
            group_by: None,
            group_by_aggregation: Aggregate::Avg,
        }
    }
}

/// What [`InputFacade::get_query_sets`] returns for a group.
pub enum QuerySets {
    /// One series per sensor, in topic order.
    Series(Vec<TimeSeries>),
    /// One whole-column aggregate per sensor (`group_by = all`).
    Aggregates(Vec<Option<Value>>),
    /// `{group: [series]}`, ready for [`crate::merge::merge`].
    ForMerge(ResultGroup),
}

impl QuerySets {
    pub fn into_series(self) -> Vec<TimeSeries> {
        match self {
            QuerySets::Series(series) => series,
            QuerySets::ForMerge(group) => group.into_values().flatten().collect(),
            QuerySets::Aggregates(_) => Vec::new(),
        }
    }
}

pub struct InputFacade {
    store: Arc<DataStore>,
    map_id: SensorMapId,
    topics: TopicMap,
    ingests: Vec<IngestId>,
    sensors: HashMap<String, SensorRecord>,
    pipeline: Option<FilterPipeline>,
}

impl InputFacade {
    /// Bind `topics` to the sensors of `map_id`. Datasets that are not
    /// complete are dropped from `ingests`; an empty list means every
    /// complete dataset of the map.
    pub fn new(
        store: Arc<DataStore>,
        map_id: SensorMapId,
        topics: TopicMap,
        ingests: Vec<IngestId>,
    ) -> Result<Self, QueryError> {
        Self::with_pipeline(store, map_id, topics, ingests, None)
    }

    pub fn with_pipeline(
        store: Arc<DataStore>,
        map_id: SensorMapId,
        topics: TopicMap,
        ingests: Vec<IngestId>,
        pipeline: Option<FilterPipeline>,
    ) -> Result<Self, QueryError> {
        // ---
        store.sensor_map(map_id)?;
        let complete: Vec<IngestId> = store
            .ingests(map_id)
            .into_iter()
            .filter(|i| i.status == IngestStatus::Complete)
            .filter(|i| ingests.is_empty() || ingests.contains(&i.id))
            .map(|i| i.id)
            .collect();
        if complete.len() < ingests.len() {
            tracing::warn!(
                requested = ingests.len(),
                usable = complete.len(),
                "ignoring datasets that are not complete"
            );
        }

        let mut sensors = HashMap::new();
        for path in topics.values().flatten() {
            let record = match pipeline.as_ref().and_then(|p| p.plans().get(path)) {
                Some(plan) => {
                    let mut record = plan.source.clone();
                    record.path = path.clone();
                    record.storage_type = plan.output_type();
                    record
                }
                None => store
                    .sensor_by_path(map_id, path)
                    .ok_or_else(|| QueryError::MissingSensor(path.clone()))?,
            };
            sensors.insert(path.clone(), record);
        }

        Ok(Self {
            store,
            map_id,
            topics,
            ingests: complete,
            sensors,
            pipeline,
        })
    }

    pub fn map_id(&self) -> SensorMapId {
        self.map_id
    }

    pub fn ingests(&self) -> &[IngestId] {
        &self.ingests
    }

    pub fn get_topics(&self) -> TopicMap {
        self.topics.clone()
    }

    pub fn get_topics_meta(&self) -> IndexMap<String, IndexMap<String, SensorMeta>> {
        // ---
        self.topics
            .iter()
            .map(|(group, paths)| {
                let metas = paths
                    .iter()
                    .filter_map(|p| self.sensors.get(p).map(|s| (p.clone(), meta(s))))
                    .collect();
                (group.clone(), metas)
            })
            .collect()
    }

    fn sensor(&self, path: &str) -> Result<&SensorRecord, QueryError> {
        self.sensors
            .get(path)
            .ok_or_else(|| QueryError::MissingSensor(path.to_string()))
    }

    fn base_query(&self, path: &str) -> Result<SensorQuery, QueryError> {
        // ---
        let record = self.sensor(path)?;
        if let Some(pipeline) = &self.pipeline {
            if pipeline.plans().contains_key(path) {
                let samples = pipeline
                    .series_within(&self.store, path, Some(&self.ingests))?
                    .collect::<Result<Vec<_>, _>>()?;
                return Ok(SensorQuery::new(record.clone(), samples));
            }
        }
        Ok(self.store.query(record.id, Some(&self.ingests))?)
    }

    /// Query sets for every sensor of `group`, in topic order.
    pub fn get_query_sets(&self, group: &str, options: &QueryOptions) -> Result<QuerySets, QueryError> {
        // ---
        let paths = self
            .topics
            .get(group)
            .ok_or_else(|| QueryError::MissingGroup(group.to_string()))?;

        let mut series = Vec::with_capacity(paths.len());
        let mut scalars = Vec::new();
        for path in paths {
            let mut query = self.base_query(path)?.order_by(options.order_by);
            for p in &options.filter {
                query = query.filter(p.clone());
            }
            for p in &options.exclude {
                query = query.exclude(p.clone());
            }
            match query.timeseries(options.group_by, options.group_by_aggregation)? {
                SeriesResult::Series(s) => series.push(s),
                SeriesResult::Scalar(v) => scalars.push(v),
            }
        }

        if options.group_by == Some(TruncKind::All) {
            return Ok(QuerySets::Aggregates(scalars));
        }
        if options.wrap_for_merge {
            return Ok(QuerySets::ForMerge(IndexMap::from([(group.to_string(), series)])));
        }
        Ok(QuerySets::Series(series))
    }

    /// Attach `topic`'s timezone to a wall-clock time. Ambiguous times take
    /// the earlier instant.
    pub fn localize_sensor_time(&self, topic: &str, time: NaiveDateTime) -> Result<Timestamp, QueryError> {
        // ---
        let record = self.sensor(topic)?;
        localize(time, record.timezone).ok_or_else(|| QueryError::NonexistentLocalTime {
            topic: topic.to_string(),
            time: time.to_string(),
        })
    }

    /// Earliest and latest timestamps across the bound sensors, after
    /// their filters.
    pub fn get_start_end_times(&self) -> Result<Option<(Timestamp, Timestamp)>, QueryError> {
        // ---
        let filtered = |path: &str| self.pipeline.as_ref().is_some_and(|p| p.plans().contains_key(path));
        let stored: Vec<_> = self
            .sensors
            .iter()
            .filter(|(path, _)| !filtered(path.as_str()))
            .map(|(_, s)| s.id)
            .collect();
        let mut range = self.store.time_range(&stored, Some(&self.ingests))?;

        for path in self.sensors.keys().filter(|path| filtered(path.as_str())) {
            for sample in self.base_query(path)?.into_series() {
                let (t, _) = sample?;
                range = Some(match range {
                    None => (t, t),
                    Some((lo, hi)) => (lo.min(t), hi.max(t)),
                });
            }
        }
        Ok(range)
    }
}

fn meta(sensor: &SensorRecord) -> SensorMeta {
    SensorMeta {
        sensor_type: sensor.sensor_type.clone(),
        unit: sensor.unit.clone(),
        timezone: sensor.timezone.name().to_string(),
        storage_type: sensor.storage_type,
    }
}
