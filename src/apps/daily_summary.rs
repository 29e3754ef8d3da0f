//! Per-day aggregate of one whole-building electricity sensor.
//!
//! Days are cut at local midnight of the sensor's timezone. With a
//! `building_area` the table also carries the energy intensity (value per
//! unit of floor area).

use anyhow::{anyhow, Context};
use indexmap::IndexMap;
use serde_json::{json, Value as Json};

use crate::analysis::{
    Application, ApplicationFactory, BatchApplication, ConfigDescriptor, ConfigType, InputDescriptor,
    OutputDescriptor, OutputFormat, Parameters,
};
use crate::facade::{InputFacade, QueryOptions, QuerySets};
use crate::models::Value;
use crate::output::{ColumnType, LogLevel, OutputRow, OutputSink};
use crate::timeseries::{Aggregate, TruncKind};

pub const NAME: &str = "daily_summary";
const INPUT: &str = "load";
const TABLE: &str = "daily_summary";

// ---

pub struct DailySummary;

impl ApplicationFactory for DailySummary {
    fn name(&self) -> &str {
        NAME
    }

    fn required_input(&self) -> IndexMap<String, InputDescriptor> {
        IndexMap::from([(
            INPUT.to_string(),
            InputDescriptor::new(Some("WholeBuildingElectricity"), "Building electric load"),
        )])
    }

    fn get_config_parameters(&self) -> IndexMap<String, ConfigDescriptor> {
        IndexMap::from([
            (
                "aggregate".to_string(),
                ConfigDescriptor::new(ConfigType::String, "Daily aggregate")
                    .default_value("avg")
                    .choices(["avg", "sum", "max", "min"]),
            ),
            (
                "building_area".to_string(),
                ConfigDescriptor::new(ConfigType::Float, "Building area")
                    .optional()
                    .range(Some(0.0), None),
            ),
        ])
    }

    fn output_format(&self, input: &InputFacade) -> anyhow::Result<OutputFormat> {
        // ---
        let topic = input
            .get_topics()
            .get(INPUT)
            .and_then(|paths| paths.first().cloned())
            .ok_or_else(|| anyhow!("input group {INPUT} is empty"))?;
        Ok(IndexMap::from([(
            TABLE.to_string(),
            IndexMap::from([
                ("date".to_string(), OutputDescriptor::new(ColumnType::Timestamp)),
                ("value".to_string(), OutputDescriptor::with_topic(ColumnType::Float, &topic)),
                ("intensity".to_string(), OutputDescriptor::new(ColumnType::Float)),
            ]),
        )]))
    }

    fn reports(&self, _output_format: &OutputFormat) -> Vec<Json> {
        vec![json!({
            "name": "Daily Summary",
            "elements": [{"type": "line_chart", "table": TABLE, "x": "date", "y": "value"}]
        })]
    }

    fn build(&self, _input: &InputFacade, parameters: &Parameters) -> anyhow::Result<Application> {
        // ---
        let aggregate = parameters
            .str("aggregate")
            .unwrap_or("avg")
            .parse::<Aggregate>()
            .map_err(|e| anyhow!(e))?;
        Ok(Application::Batch(Box::new(DailySummaryRun {
            aggregate,
            building_area: parameters.f64("building_area").filter(|a| *a > 0.0),
        })))
    }
}

struct DailySummaryRun {
    aggregate: Aggregate,
    building_area: Option<f64>,
}

impl BatchApplication for DailySummaryRun {
    fn execute(&mut self, input: &InputFacade, output: &mut dyn OutputSink) -> anyhow::Result<()> {
        // ---
        let options = QueryOptions {
            group_by: Some(TruncKind::Day),
            group_by_aggregation: self.aggregate,
            ..QueryOptions::default()
        };
        let series = match input.get_query_sets(INPUT, &options)? {
            QuerySets::Series(series) => series,
            _ => anyhow::bail!("expected one series for {INPUT}"),
        };

        let mut days = 0usize;
        for series in series {
            for sample in series {
                let (day, value) = sample.context("reading daily load")?;
                let intensity = match (value.as_f64(), self.building_area) {
                    (Some(v), Some(area)) => Some(Value::Float(v / area)),
                    _ => None,
                };
                output.insert_row(
                    TABLE,
                    OutputRow::from([
                        ("date".to_string(), Some(Value::Datetime(day))),
                        ("value".to_string(), Some(value)),
                        ("intensity".to_string(), intensity),
                    ]),
                )?;
                days += 1;
            }
        }

        if days == 0 {
            output.log("no data in the selected datasets", LogLevel::Warning, None);
        } else {
            output.log(&format!("summarized {days} day(s)"), LogLevel::Info, None);
        }
        Ok(())
    }
}
