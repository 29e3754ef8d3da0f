//! Export merged input rows, one output row per timestamp.

use anyhow::anyhow;
use indexmap::IndexMap;

use crate::analysis::{
    Application, ApplicationFactory, ConfigDescriptor, ConfigType, DrivenApplication, InputDescriptor,
    OutputDescriptor, OutputFormat, Parameters, Points, Results,
};
use crate::facade::InputFacade;
use crate::models::{Timestamp, Value};
use crate::output::{ColumnType, LogLevel, OutputRow};

pub const NAME: &str = "timeseries_export";
const INPUT: &str = "points";
const TABLE: &str = "export";

// ---

pub struct TimeseriesExport;

impl ApplicationFactory for TimeseriesExport {
    fn name(&self) -> &str {
        NAME
    }

    fn required_input(&self) -> IndexMap<String, InputDescriptor> {
        IndexMap::from([(
            INPUT.to_string(),
            InputDescriptor::new(None, "Sensors to export").count(1, None),
        )])
    }

    fn get_config_parameters(&self) -> IndexMap<String, ConfigDescriptor> {
        IndexMap::from([(
            "drop_partial".to_string(),
            ConfigDescriptor::new(ConfigType::Boolean, "Only timestamps every sensor has").default_value(false),
        )])
    }

    fn output_format(&self, input: &InputFacade) -> anyhow::Result<OutputFormat> {
        // ---
        let meta = input.get_topics_meta();
        let sensors = meta
            .get(INPUT)
            .ok_or_else(|| anyhow!("input group {INPUT} is not bound"))?;

        let mut columns = IndexMap::from([("time".to_string(), OutputDescriptor::new(ColumnType::Timestamp))]);
        for (path, meta) in sensors {
            columns.insert(path.clone(), OutputDescriptor::with_topic(meta.storage_type.into(), path));
        }
        Ok(IndexMap::from([(TABLE.to_string(), columns)]))
    }

    fn build(&self, input: &InputFacade, parameters: &Parameters) -> anyhow::Result<Application> {
        // ---
        let topics = input.get_topics().get(INPUT).cloned().unwrap_or_default();
        Ok(Application::Driven(Box::new(ExportRun {
            topics,
            drop_partial: parameters.bool("drop_partial").unwrap_or(false),
            rows: 0,
        })))
    }
}

struct ExportRun {
    topics: Vec<String>,
    drop_partial: bool,
    rows: u64,
}

impl DrivenApplication for ExportRun {
    fn drop_partial_lines(&self) -> bool {
        self.drop_partial
    }

    fn run(&mut self, current_time: Timestamp, points: &Points) -> anyhow::Result<Results> {
        // ---
        let values = points
            .get(INPUT)
            .ok_or_else(|| anyhow!("no values for {INPUT} at {current_time}"))?;

        let mut row = OutputRow::from([("time".to_string(), Some(Value::Datetime(current_time)))]);
        for (topic, value) in self.topics.iter().zip(values) {
            row.insert(topic.clone(), value.clone());
        }
        self.rows += 1;

        let mut results = Results::new();
        results.insert_table_row(TABLE, row);
        Ok(results)
    }

    fn shutdown(&mut self) -> anyhow::Result<Results> {
        let mut results = Results::new();
        results.log(format!("exported {} row(s)", self.rows), LogLevel::Info, None);
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::analysis::{Analysis, AnalysisConfig, AnalysisDriver};
    use crate::catalog::Catalog;
    use crate::models::ProjectId;
    use crate::output::{CsvOutput, OutputSink};
    use crate::sensormap::SensorMap;
    use crate::store::{DataStore, IngestStatus};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    #[test]
    fn test_export_to_csv() {
        // ---
        let doc = json!({
            "version": 1,
            "files": {"0": {"signature": {"headers": ["Date", "OAT", "Fan"]}, "timestamp": {"columns": [0]}}},
            "sensors": {
                "Site/OAT": {"type": "OutdoorAirTemperature", "unit": "fahrenheit", "file": "0", "column": 1},
                "Site/Fan": {"type": "SupplyFanStatus", "unit": null, "file": "0", "column": 2}
            }
        });
        let map = SensorMap::from_value(doc, Catalog::builtin()).unwrap();
        let store = DataStore::new();
        let map_id = store
            .create_sensor_map(ProjectId::new(1), "m", map, Catalog::builtin())
            .unwrap();
        let ingest = store.create_ingest(map_id, "i", IndexMap::new()).unwrap();
        let at = |h| Utc.with_ymd_and_hms(2014, 1, 1, h, 0, 0).unwrap();
        let oat = store.sensor_by_path(map_id, "Site/OAT").unwrap();
        let fan = store.sensor_by_path(map_id, "Site/Fan").unwrap();
        store
            .append(ingest, oat.id, vec![(at(0), Value::Float(50.5)), (at(1), Value::Float(51.0))])
            .unwrap();
        store.append(ingest, fan.id, vec![(at(1), Value::Boolean(true))]).unwrap();
        store.set_ingest_status(ingest, IngestStatus::Complete).unwrap();

        let config: AnalysisConfig =
            serde_json::from_value(json!({"inputs": {"points": ["Site/OAT", "Site/Fan"]}})).unwrap();
        let mut analysis = Analysis::new(ProjectId::new(1), "export", NAME, map_id, Vec::new(), config);
        let root = tempfile::tempdir().unwrap();
        let mut sink = CsvOutput::new(root.path(), analysis.id);
        let driver = AnalysisDriver::new(store, crate::apps::registry());
        driver.run(&mut analysis, &mut sink as &mut dyn OutputSink).unwrap();

        let text = std::fs::read_to_string(sink.table_path(TABLE)).unwrap();
        assert_eq!(
            text,
            "time,Site/OAT,Site/Fan\n2014-01-01T00:00:00Z,50.5,\n2014-01-01T01:00:00Z,51,true\n"
        );
    }
}
