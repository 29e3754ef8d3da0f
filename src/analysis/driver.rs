//! Analysis driver.
//!
//! Takes an [`Analysis`] from `created` through `running` to `complete`
//! or `error`: resolves the application, validates the bound
//! configuration, declares the output tables and runs the application in
//! batch or driven mode. Partial output of a failed run is flushed and
//! kept.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use crate::facade::{InputFacade, QueryOptions, QuerySets, TopicMap};
use crate::merge::merge;
use crate::models::{AnalysisId, IngestId, ProjectId, SensorMapId, Timestamp};
use crate::output::OutputSink;
use crate::store::DataStore;

use super::application::{field_spec, Application, ApplicationFactory, ApplicationRegistry, DrivenApplication, Parameters, Results};
use super::AnalysisError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisStatus {
    Created,
    Running,
    Complete,
    Error,
}

impl fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AnalysisStatus::Created => "created",
            AnalysisStatus::Running => "running",
            AnalysisStatus::Complete => "complete",
            AnalysisStatus::Error => "error",
        };
        f.write_str(name)
    }
}

/// `{"parameters": {...}, "inputs": {group: [sensor path, ...]}}`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default)]
    pub parameters: Map<String, Json>,
    #[serde(default)]
    pub inputs: TopicMap,
}

#[derive(Debug, Clone, Serialize)]
pub struct Analysis {
    pub id: AnalysisId,
    pub project: ProjectId,
    pub name: String,
    pub application: String,
    pub map_id: SensorMapId,
    /// Datasets to read; empty means every complete dataset of the map.
    pub ingests: Vec<IngestId>,
    pub config: AnalysisConfig,
    pub status: AnalysisStatus,
    /// Percent done, 0 to 100.
    pub progress: f64,
    pub message: Option<String>,
    pub reports: Vec<Json>,
    pub created: Timestamp,
    pub started: Option<Timestamp>,
    pub ended: Option<Timestamp>,
}

impl Analysis {
    pub fn new(
        project: ProjectId,
        name: &str,
        application: &str,
        map_id: SensorMapId,
        ingests: Vec<IngestId>,
        config: AnalysisConfig,
    ) -> Self {
        Self {
            id: AnalysisId::new(),
            project,
            name: name.to_string(),
            application: application.to_string(),
            map_id,
            ingests,
            config,
            status: AnalysisStatus::Created,
            progress: 0.0,
            message: None,
            reports: Vec::new(),
            created: Utc::now(),
            started: None,
            ended: None,
        }
    }
}

// ---

pub struct AnalysisDriver {
    store: Arc<DataStore>,
    registry: ApplicationRegistry,
}

impl AnalysisDriver {
    pub fn new(store: Arc<DataStore>, registry: ApplicationRegistry) -> Self {
        Self { store, registry }
    }

    pub fn registry(&self) -> &ApplicationRegistry {
        &self.registry
    }

    /// Check the analysis' parameters and input bindings against what its
    /// application declares. Every problem is reported, keyed by
    /// `parameters.<name>` or `inputs.<group>`.
    pub fn validate(&self, analysis: &Analysis) -> Result<(Arc<dyn ApplicationFactory>, Parameters), AnalysisError> {
        // ---
        let factory = self
            .registry
            .get(&analysis.application)
            .ok_or_else(|| AnalysisError::UnknownApplication(analysis.application.clone()))?;

        let mut errors: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut report = |key: String, message: String| errors.entry(key).or_default().push(message);

        let declared = factory.get_config_parameters();
        let mut values = Map::new();
        for (name, descriptor) in &declared {
            match descriptor.resolve(analysis.config.parameters.get(name)) {
                Ok(Some(value)) => {
                    values.insert(name.clone(), value);
                }
                Ok(None) => {}
                Err(message) => report(format!("parameters.{name}"), message),
            }
        }
        for name in analysis.config.parameters.keys() {
            if !declared.contains_key(name) {
                report(format!("parameters.{name}"), "unknown parameter".to_string());
            }
        }

        let required = factory.required_input();
        for (group, descriptor) in &required {
            let key = format!("inputs.{group}");
            let paths = analysis.config.inputs.get(group).map(Vec::as_slice).unwrap_or_default();
            if paths.len() < descriptor.count_min {
                report(key.clone(), format!("at least {} sensor(s) required", descriptor.count_min));
            }
            if let Some(max) = descriptor.count_max {
                if paths.len() > max {
                    report(key.clone(), format!("at most {max} sensor(s) allowed"));
                }
            }
            for path in paths {
                match self.store.sensor_by_path(analysis.map_id, path) {
                    None => report(key.clone(), format!("sensor {path} does not exist")),
                    Some(sensor) => {
                        if let Some(wanted) = &descriptor.sensor_type {
                            if &sensor.sensor_type != wanted {
                                report(
                                    key.clone(),
                                    format!("sensor {path} is a {}, expected {wanted}", sensor.sensor_type),
                                );
                            }
                        }
                    }
                }
            }
        }
        for group in analysis.config.inputs.keys() {
            if !required.contains_key(group) {
                report(format!("inputs.{group}"), "unknown input group".to_string());
            }
        }

        if !errors.is_empty() {
            return Err(AnalysisError::InvalidConfig(errors));
        }
        Ok((factory, Parameters::new(values)))
    }

    fn transition(analysis: &mut Analysis, status: AnalysisStatus) {
        tracing::info!(
            analysis = %analysis.id,
            application = %analysis.application,
            from = %analysis.status,
            to = %status,
            "analysis state changed"
        );
        analysis.status = status;
    }

    /// Run a created analysis to completion, writing into `sink`.
    pub fn run(&self, analysis: &mut Analysis, sink: &mut dyn OutputSink) -> Result<(), AnalysisError> {
        // ---
        if analysis.status != AnalysisStatus::Created {
            return Err(AnalysisError::InvalidState(analysis.status));
        }

        let outcome = match self.validate(analysis) {
            Ok((factory, parameters)) => {
                Self::transition(analysis, AnalysisStatus::Running);
                analysis.started = Some(Utc::now());
                self.execute(analysis, factory.as_ref(), &parameters, sink)
            }
            Err(e) => Err(e),
        };
        analysis.ended = Some(Utc::now());

        match outcome {
            Ok(reports) => {
                analysis.reports = reports;
                analysis.progress = 100.0;
                Self::transition(analysis, AnalysisStatus::Complete);
                Ok(())
            }
            Err(e) => {
                if let Err(flush) = sink.flush() {
                    tracing::warn!(analysis = %analysis.id, error = %flush, "could not flush partial output");
                }
                tracing::error!(analysis = %analysis.id, error = %e, "analysis failed");
                analysis.message = Some(e.to_string());
                Self::transition(analysis, AnalysisStatus::Error);
                Err(e)
            }
        }
    }

    fn execute(
        &self,
        analysis: &mut Analysis,
        factory: &dyn ApplicationFactory,
        parameters: &Parameters,
        sink: &mut dyn OutputSink,
    ) -> Result<Vec<Json>, AnalysisError> {
        // ---
        let facade = InputFacade::new(
            self.store.clone(),
            analysis.map_id,
            analysis.config.inputs.clone(),
            analysis.ingests.clone(),
        )?;

        let format = factory.output_format(&facade).map_err(AnalysisError::Application)?;
        for (table, columns) in &format {
            sink.create_table(table, &field_spec(columns))?;
        }

        match factory.build(&facade, parameters).map_err(AnalysisError::Application)? {
            Application::Batch(mut app) => app.execute(&facade, sink).map_err(AnalysisError::Application)?,
            Application::Driven(mut app) => drive(app.as_mut(), &facade, sink, analysis)?,
        }

        sink.flush()?;
        Ok(factory.reports(&format))
    }
}

/// Feed merged input rows to a driven application, one call per
/// timestamp.
fn drive(
    app: &mut dyn DrivenApplication,
    facade: &InputFacade,
    sink: &mut dyn OutputSink,
    analysis: &mut Analysis,
) -> Result<(), AnalysisError> {
    // ---
    let range = facade.get_start_end_times()?;
    let options = QueryOptions {
        wrap_for_merge: true,
        ..QueryOptions::default()
    };
    let mut groups = Vec::new();
    for group in facade.get_topics().keys() {
        if let QuerySets::ForMerge(g) = facade.get_query_sets(group, &options)? {
            groups.push(g);
        }
    }

    let mut rows = 0u64;
    for row in merge(groups, app.drop_partial_lines()) {
        let row = row?;
        let results = app.run(row.time, &row.groups).map_err(AnalysisError::Application)?;
        apply_results(sink, results)?;
        rows += 1;
        if let Some((start, end)) = range {
            analysis.progress = progress(start, end, row.time);
        }
    }
    let results = app.shutdown().map_err(AnalysisError::Application)?;
    apply_results(sink, results)?;

    tracing::debug!(analysis = %analysis.id, rows, "driven run finished");
    Ok(())
}

fn apply_results(sink: &mut dyn OutputSink, results: Results) -> Result<(), AnalysisError> {
    // ---
    for (table, rows) in results.table_rows {
        for row in rows {
            sink.insert_row(&table, row)?;
        }
    }
    for (message, level, timestamp) in results.log_messages {
        sink.log(&message, level, timestamp);
    }
    Ok(())
}

/// Share of `[start, end]` consumed at `time`, in percent.
fn progress(start: Timestamp, end: Timestamp, time: Timestamp) -> f64 {
    let total = (end - start).num_milliseconds();
    if total <= 0 {
        return 100.0;
    }
    let done = (time - start).num_milliseconds() as f64 / total as f64;
    (done * 100.0).clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::analysis::application::{BatchApplication, ConfigDescriptor, ConfigType, InputDescriptor, OutputFormat, Points};
    use crate::analysis::OutputDescriptor;
    use crate::catalog::Catalog;
    use crate::models::Value;
    use crate::output::{ColumnType, LogLevel, OutputRow, OutputTables, TableOutput};
    use crate::sensormap::SensorMap;
    use crate::store::IngestStatus;
    use chrono::TimeZone;
    use indexmap::IndexMap;
    use serde_json::json;

    fn at(h: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2014, 1, 1, h, 0, 0).unwrap()
    }

    fn store() -> (Arc<DataStore>, SensorMapId) {
        let doc = json!({
            "version": 1,
            "files": {"0": {"signature": {"headers": ["Date", "A", "B"]}, "timestamp": {"columns": [0]}}},
            "sensors": {
                "Site/A": {"type": "WholeBuildingElectricity", "unit": "kilowatt", "file": "0", "column": 1},
                "Site/B": {"type": "OutdoorAirTemperature", "unit": "fahrenheit", "file": "0", "column": 2}
            }
        });
        let map = SensorMap::from_value(doc, Catalog::builtin()).unwrap();
        let store = DataStore::new();
        let map_id = store
            .create_sensor_map(ProjectId::new(1), "m", map, Catalog::builtin())
            .unwrap();
        let ingest = store.create_ingest(map_id, "i", IndexMap::new()).unwrap();
        let a = store.sensor_by_path(map_id, "Site/A").unwrap();
        let b = store.sensor_by_path(map_id, "Site/B").unwrap();
        store
            .append(ingest, a.id, (0..5).map(|h| (at(h), Value::Float(h as f64))).collect())
            .unwrap();
        store
            .append(ingest, b.id, vec![(at(0), Value::Float(50.0)), (at(4), Value::Float(60.0))])
            .unwrap();
        store.set_ingest_status(ingest, IngestStatus::Complete).unwrap();
        (store, map_id)
    }

    /// Driven app copying group `load` into `out`, failing at `fail_at`.
    struct Echo {
        fail_at: Option<Timestamp>,
        drop_partial: bool,
    }

    impl DrivenApplication for Echo {
        fn drop_partial_lines(&self) -> bool {
            self.drop_partial
        }

        fn run(&mut self, current_time: Timestamp, points: &Points) -> anyhow::Result<Results> {
            if Some(current_time) == self.fail_at {
                anyhow::bail!("bad point at {current_time}");
            }
            let mut results = Results::new();
            results.insert_table_row(
                "out",
                OutputRow::from([
                    ("time".to_string(), Some(Value::Datetime(current_time))),
                    ("value".to_string(), points["load"][0].clone()),
                ]),
            );
            Ok(results)
        }

        fn shutdown(&mut self) -> anyhow::Result<Results> {
            let mut results = Results::new();
            results.log("finished", LogLevel::Info, None);
            Ok(results)
        }
    }

    struct Total;

    impl BatchApplication for Total {
        fn execute(&mut self, input: &InputFacade, output: &mut dyn OutputSink) -> anyhow::Result<()> {
            let options = QueryOptions {
                group_by: Some(crate::timeseries::TruncKind::All),
                group_by_aggregation: crate::timeseries::Aggregate::Sum,
                ..QueryOptions::default()
            };
            if let QuerySets::Aggregates(values) = input.get_query_sets("load", &options)? {
                output.insert_row(
                    "out",
                    OutputRow::from([
                        ("time".to_string(), Some(Value::Datetime(at(0)))),
                        ("value".to_string(), values[0].clone()),
                    ]),
                )?;
            }
            Ok(())
        }
    }

    struct TestFactory {
        name: &'static str,
        fail_at: Option<Timestamp>,
    }

    impl ApplicationFactory for TestFactory {
        fn name(&self) -> &str {
            self.name
        }

        fn required_input(&self) -> IndexMap<String, InputDescriptor> {
            IndexMap::from([
                ("load".to_string(), InputDescriptor::new(Some("WholeBuildingElectricity"), "load")),
                (
                    "oat".to_string(),
                    InputDescriptor::new(Some("OutdoorAirTemperature"), "temperature").count(0, Some(1)),
                ),
            ])
        }

        fn get_config_parameters(&self) -> IndexMap<String, ConfigDescriptor> {
            IndexMap::from([(
                "drop_partial".to_string(),
                ConfigDescriptor::new(ConfigType::Boolean, "Drop partial rows").default_value(false),
            )])
        }

        fn output_format(&self, _input: &InputFacade) -> anyhow::Result<OutputFormat> {
            Ok(IndexMap::from([(
                "out".to_string(),
                IndexMap::from([
                    ("time".to_string(), OutputDescriptor::new(ColumnType::Timestamp)),
                    ("value".to_string(), OutputDescriptor::new(ColumnType::Float)),
                ]),
            )]))
        }

        fn reports(&self, output_format: &OutputFormat) -> Vec<Json> {
            vec![json!({"tables": output_format.keys().collect::<Vec<_>>()})]
        }

        fn build(&self, _input: &InputFacade, parameters: &Parameters) -> anyhow::Result<Application> {
            if self.name == "total" {
                return Ok(Application::Batch(Box::new(Total)));
            }
            Ok(Application::Driven(Box::new(Echo {
                fail_at: self.fail_at,
                drop_partial: parameters.bool("drop_partial").unwrap_or(false),
            })))
        }
    }

    fn driver(store: Arc<DataStore>) -> AnalysisDriver {
        let mut registry = ApplicationRegistry::new();
        registry.register(Arc::new(TestFactory { name: "echo", fail_at: None }));
        registry.register(Arc::new(TestFactory { name: "failing", fail_at: Some(at(2)) }));
        registry.register(Arc::new(TestFactory { name: "total", fail_at: None }));
        AnalysisDriver::new(store, registry)
    }

    fn analysis(map_id: SensorMapId, application: &str, config: Json) -> Analysis {
        let config: AnalysisConfig = serde_json::from_value(config).unwrap();
        Analysis::new(ProjectId::new(1), "test", application, map_id, Vec::new(), config)
    }

    fn sink() -> (Arc<OutputTables>, TableOutput, AnalysisId) {
        let tables = OutputTables::new();
        let id = AnalysisId::new();
        (tables.clone(), TableOutput::new(tables, ProjectId::new(1), id), id)
    }

    #[test]
    fn test_driven_run_completes() {
        // ---
        let (store, map_id) = store();
        let driver = driver(store);
        let mut run = analysis(
            map_id,
            "echo",
            json!({"inputs": {"load": ["Site/A"], "oat": ["Site/B"]}}),
        );
        let (tables, mut out, _) = sink();
        driver.run(&mut run, &mut out).unwrap();

        assert_eq!(run.status, AnalysisStatus::Complete);
        assert_eq!(run.progress, 100.0);
        assert!(run.ended.is_some());
        assert_eq!(run.reports, vec![json!({"tables": ["out"]})]);
        assert_eq!(tables.rows(&out.handles()["out"]).len(), 5);
        assert_eq!(out.logs().len(), 1);
    }

    #[test]
    fn test_driven_run_with_drop_partial() {
        // ---
        let (store, map_id) = store();
        let driver = driver(store);
        let mut run = analysis(
            map_id,
            "echo",
            json!({"parameters": {"drop_partial": true}, "inputs": {"load": ["Site/A"], "oat": ["Site/B"]}}),
        );
        let (tables, mut out, _) = sink();
        driver.run(&mut run, &mut out).unwrap();
        assert_eq!(tables.rows(&out.handles()["out"]).len(), 2);
    }

    #[test]
    fn test_batch_run() {
        // ---
        let (store, map_id) = store();
        let driver = driver(store);
        let mut run = analysis(map_id, "total", json!({"inputs": {"load": ["Site/A"]}}));
        let (tables, mut out, _) = sink();
        driver.run(&mut run, &mut out).unwrap();
        let rows = tables.rows(&out.handles()["out"]);
        assert_eq!(rows[0]["value"], Some(Value::Float(10.0)));
    }

    #[test]
    fn test_failure_keeps_partial_output() {
        // ---
        let (store, map_id) = store();
        let driver = driver(store);
        let mut run = analysis(map_id, "failing", json!({"inputs": {"load": ["Site/A"]}}));
        let (tables, mut out, _) = sink();
        let err = driver.run(&mut run, &mut out).unwrap_err();

        assert!(matches!(err, AnalysisError::Application(_)));
        assert_eq!(run.status, AnalysisStatus::Error);
        assert!(run.message.as_deref().unwrap_or_default().contains("bad point"));
        assert!(run.ended.is_some());
        assert_eq!(tables.rows(&out.handles()["out"]).len(), 2);
        assert!(matches!(
            driver.run(&mut run, &mut out),
            Err(AnalysisError::InvalidState(AnalysisStatus::Error))
        ));
    }

    #[test]
    fn test_invalid_config_is_reported_in_full() {
        // ---
        let (store, map_id) = store();
        let driver = driver(store);
        let mut run = analysis(
            map_id,
            "echo",
            json!({
                "parameters": {"drop_partial": "yes", "color": 1},
                "inputs": {"load": ["Site/B"], "extra": []}
            }),
        );
        let (_, mut out, _) = sink();
        let Err(AnalysisError::InvalidConfig(errors)) = driver.run(&mut run, &mut out) else {
            panic!("expected a configuration error");
        };
        let keys: Vec<&str> = errors.keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            vec!["inputs.extra", "inputs.load", "parameters.color", "parameters.drop_partial"]
        );
        assert_eq!(run.status, AnalysisStatus::Error);
        assert!(run.started.is_none());
    }

    #[test]
    fn test_unknown_application() {
        // ---
        let (store, map_id) = store();
        let driver = driver(store);
        let mut run = analysis(map_id, "nope", json!({}));
        let (_, mut out, _) = sink();
        assert!(matches!(
            driver.run(&mut run, &mut out),
            Err(AnalysisError::UnknownApplication(_))
        ));
    }

    #[test]
    fn test_progress() {
        // ---
        assert_eq!(progress(at(0), at(4), at(1)), 25.0);
        assert_eq!(progress(at(0), at(0), at(0)), 100.0);
    }
}
