//! Contract between the analysis driver and applications.
//!
//! An [`ApplicationFactory`] describes an application (inputs, options,
//! output tables, report metadata) and builds a runnable
//! [`Application`]. Batch applications query the input facade and write
//! rows themselves; driven applications are fed one merged row per
//! timestamp and hand back [`Results`].

use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use crate::facade::InputFacade;
use crate::models::{StorageType, Timestamp, Value};
use crate::output::{ColumnType, FieldSpec, LogLevel, OutputRow};

/// `{table name: {column name: descriptor}}`.
pub type OutputFormat = IndexMap<String, IndexMap<String, OutputDescriptor>>;

/// Merged values handed to a driven application, keyed by input group.
pub type Points = IndexMap<String, Vec<Option<Value>>>;

// ---

/// What an application expects bound to one input group.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InputDescriptor {
    /// Required sensor type, any type when `None`.
    pub sensor_type: Option<String>,
    pub count_min: usize,
    pub count_max: Option<usize>,
    pub description: String,
}

impl InputDescriptor {
    pub fn new(sensor_type: Option<&str>, description: &str) -> Self {
        Self {
            sensor_type: sensor_type.map(str::to_string),
            count_min: 1,
            count_max: Some(1),
            description: description.to_string(),
        }
    }

    pub fn count(mut self, min: usize, max: Option<usize>) -> Self {
        self.count_min = min;
        self.count_max = max;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigType {
    Boolean,
    Integer,
    Float,
    String,
}

/// One application option.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigDescriptor {
    pub value_type: ConfigType,
    pub display_name: String,
    pub optional: bool,
    pub value_default: Option<Json>,
    pub value_min: Option<f64>,
    pub value_max: Option<f64>,
    pub value_list: Option<Vec<Json>>,
}

impl ConfigDescriptor {
    pub fn new(value_type: ConfigType, display_name: &str) -> Self {
        Self {
            value_type,
            display_name: display_name.to_string(),
            optional: false,
            value_default: None,
            value_min: None,
            value_max: None,
            value_list: None,
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<Json>) -> Self {
        self.value_default = Some(value.into());
        self
    }

    pub fn range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.value_min = min;
        self.value_max = max;
        self
    }

    pub fn choices<T: Into<Json>>(mut self, values: impl IntoIterator<Item = T>) -> Self {
        self.value_list = Some(values.into_iter().map(Into::into).collect());
        self
    }

    /// Resolve the bound value of this option: the given value, else the
    /// default. `Ok(None)` means an optional option was left unset.
    pub fn resolve(&self, value: Option<&Json>) -> Result<Option<Json>, String> {
        // ---
        let Some(value) = value.or(self.value_default.as_ref()) else {
            if self.optional {
                return Ok(None);
            }
            return Err("a value is required".to_string());
        };

        let (type_ok, expected) = match self.value_type {
            ConfigType::Boolean => (value.is_boolean(), "boolean"),
            ConfigType::Integer => (value.is_i64() || value.is_u64(), "integer"),
            ConfigType::Float => (value.is_number(), "float"),
            ConfigType::String => (value.is_string(), "string"),
        };
        if !type_ok {
            return Err(format!("expected a {expected} value, got {value}"));
        }

        if let Some(n) = value.as_f64() {
            if self.value_min.is_some_and(|min| n < min) || self.value_max.is_some_and(|max| n > max) {
                let bound = |b: Option<f64>| b.map_or_else(|| "..".to_string(), |b| b.to_string());
                return Err(format!(
                    "{n} is outside [{}, {}]",
                    bound(self.value_min),
                    bound(self.value_max)
                ));
            }
        }
        if let Some(list) = &self.value_list {
            if !list.contains(value) {
                return Err(format!("{value} is not one of {}", Json::Array(list.clone())));
            }
        }
        Ok(Some(value.clone()))
    }
}

/// One column of an output table. `topic` names the input sensor the
/// column is derived from, when there is one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputDescriptor {
    pub column_type: ColumnType,
    pub topic: Option<String>,
}

impl OutputDescriptor {
    pub fn new(column_type: ColumnType) -> Self {
        Self {
            column_type,
            topic: None,
        }
    }

    pub fn with_topic(column_type: ColumnType, topic: &str) -> Self {
        Self {
            column_type,
            topic: Some(topic.to_string()),
        }
    }
}

impl From<StorageType> for ColumnType {
    fn from(st: StorageType) -> Self {
        match st {
            StorageType::Boolean => ColumnType::Boolean,
            StorageType::Datetime => ColumnType::Datetime,
            StorageType::Float => ColumnType::Float,
            StorageType::Integer => ColumnType::Integer,
            StorageType::String => ColumnType::String,
        }
    }
}

/// Column types of one table of an [`OutputFormat`].
pub fn field_spec(columns: &IndexMap<String, OutputDescriptor>) -> FieldSpec {
    columns
        .iter()
        .map(|(name, d)| (name.clone(), d.column_type))
        .collect()
}

/// Validated option values, defaults filled in.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Parameters(Map<String, Json>);

impl Parameters {
    pub fn new(values: Map<String, Json>) -> Self {
        Self(values)
    }

    pub fn get(&self, name: &str) -> Option<&Json> {
        self.0.get(name)
    }

    pub fn f64(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(Json::as_f64)
    }

    pub fn i64(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(Json::as_i64)
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(Json::as_bool)
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Json::as_str)
    }

    pub fn as_map(&self) -> &Map<String, Json> {
        &self.0
    }
}

/// Rows and log messages returned by a driven application for one step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Results {
    pub table_rows: IndexMap<String, Vec<OutputRow>>,
    pub log_messages: Vec<(String, LogLevel, Option<Timestamp>)>,
}

impl Results {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_table_row(&mut self, table: &str, row: OutputRow) {
        self.table_rows.entry(table.to_string()).or_default().push(row);
    }

    pub fn log(&mut self, message: impl Into<String>, level: LogLevel, timestamp: Option<Timestamp>) {
        self.log_messages.push((message.into(), level, timestamp));
    }

    pub fn is_empty(&self) -> bool {
        self.table_rows.is_empty() && self.log_messages.is_empty()
    }
}

pub trait BatchApplication: Send {
    fn execute(&mut self, input: &InputFacade, output: &mut dyn crate::output::OutputSink) -> anyhow::Result<()>;
}

pub trait DrivenApplication: Send {
    /// Whether timestamps missing from any input are skipped.
    fn drop_partial_lines(&self) -> bool {
        true
    }

    fn run(&mut self, current_time: Timestamp, points: &Points) -> anyhow::Result<Results>;

    /// Called once after the last row.
    fn shutdown(&mut self) -> anyhow::Result<Results> {
        Ok(Results::new())
    }
}

pub enum Application {
    Batch(Box<dyn BatchApplication>),
    Driven(Box<dyn DrivenApplication>),
}

pub trait ApplicationFactory: Send + Sync {
    fn name(&self) -> &str;

    fn required_input(&self) -> IndexMap<String, InputDescriptor>;

    fn get_config_parameters(&self) -> IndexMap<String, ConfigDescriptor>;

    fn output_format(&self, input: &InputFacade) -> anyhow::Result<OutputFormat>;

    /// Report metadata for the rendering layer. Opaque to the core.
    fn reports(&self, _output_format: &OutputFormat) -> Vec<Json> {
        Vec::new()
    }

    fn build(&self, input: &InputFacade, parameters: &Parameters) -> anyhow::Result<Application>;
}

/// Applications by name.
#[derive(Default, Clone)]
pub struct ApplicationRegistry {
    factories: IndexMap<String, Arc<dyn ApplicationFactory>>,
}

impl ApplicationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, factory: Arc<dyn ApplicationFactory>) {
        self.factories.insert(factory.name().to_string(), factory);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ApplicationFactory>> {
        self.factories.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}
