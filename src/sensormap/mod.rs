//! Sensor-map documents.
//!
//! A sensor map declares the CSV files of a dataset, how their columns are
//! laid out and which column feeds which sensor in the
//! site/building/system hierarchy. Documents arrive as JSON and are only
//! turned into a [`SensorMap`] after [`validate`] accepts them, so code
//! holding a `SensorMap` may rely on every reference resolving.

use std::str::FromStr;

use chrono_tz::Tz;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::catalog::Catalog;

mod validate;

pub use validate::{validate, PathSegment, SchemaErrors};

/// Sensor-map schema version understood by this crate.
pub const SENSOR_MAP_VERSION: u64 = 1;

/// Name of the attribute carrying an IANA timezone on group nodes.
pub const TIMEZONE_ATTRIBUTE: &str = "timezone";

fn default_separator() -> String {
    " ".to_string()
}

// ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorMap {
    pub version: u32,
    pub files: IndexMap<String, FileSpec>,
    pub sensors: IndexMap<String, SensorMapNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileSpec {
    pub signature: Signature,
    pub timestamp: TimestampSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signature {
    pub headers: Vec<Option<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimestampSpec {
    pub columns: Vec<ColumnRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default = "default_separator")]
    pub separator: String,
}

/// A column named by header text or by zero-based position.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnRef {
    Index(usize),
    Name(String),
}

impl std::fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ColumnRef::Index(i) => write!(f, "{i}"),
            ColumnRef::Name(name) => write!(f, "{name:?}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SensorMapNode {
    Sensor(SensorNode),
    Group(GroupNode),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorNode {
    #[serde(rename = "type")]
    pub sensor_type: String,
    #[serde(default)]
    pub unit: Option<String>,
    pub file: String,
    pub column: ColumnRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupNode {
    pub level: GroupLevel,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupLevel {
    Site,
    Building,
    System,
    Other,
}

impl FileSpec {
    /// Zero-based index of `column` within this file's header signature.
    pub fn resolve_column(&self, column: &ColumnRef) -> Option<usize> {
        // ---
        match column {
            ColumnRef::Index(i) => (*i < self.signature.headers.len()).then_some(*i),
            ColumnRef::Name(name) => self
                .signature
                .headers
                .iter()
                .position(|h| h.as_deref() == Some(name.as_str())),
        }
    }
}

/// Proper ancestors of a slash-separated path, nearest first.
pub fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    path.match_indices('/').rev().map(move |(i, _)| &path[..i])
}

impl SensorMap {
    /// Validate a JSON document and build the typed map from it.
    pub fn from_value(doc: serde_json::Value, catalog: &Catalog) -> Result<SensorMap, SchemaErrors> {
        // ---
        let errors = validate(&doc, catalog);
        if !errors.is_empty() {
            return Err(errors);
        }
        serde_json::from_value(doc).map_err(|e| SchemaErrors::single(Vec::new(), e.to_string()))
    }

    pub fn from_json_str(text: &str, catalog: &Catalog) -> Result<SensorMap, SchemaErrors> {
        // ---
        let doc: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| SchemaErrors::single(Vec::new(), format!("invalid JSON: {e}")))?;
        SensorMap::from_value(doc, catalog)
    }

    /// Re-run validation on an already typed map, e.g. after editing it.
    pub fn validate(&self, catalog: &Catalog) -> SchemaErrors {
        // ---
        match serde_json::to_value(self) {
            Ok(doc) => validate(&doc, catalog),
            Err(e) => SchemaErrors::single(Vec::new(), e.to_string()),
        }
    }

    pub fn sensor_nodes(&self) -> impl Iterator<Item = (&str, &SensorNode)> {
        self.sensors.iter().filter_map(|(path, node)| match node {
            SensorMapNode::Sensor(sensor) => Some((path.as_str(), sensor)),
            SensorMapNode::Group(_) => None,
        })
    }

    pub fn sensor(&self, path: &str) -> Option<&SensorNode> {
        match self.sensors.get(path) {
            Some(SensorMapNode::Sensor(sensor)) => Some(sensor),
            _ => None,
        }
    }

    /// Sensors fed by `file_key`, in map order.
    pub fn sensors_for_file<'a>(
        &'a self,
        file_key: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a SensorNode)> + 'a {
        self.sensor_nodes()
            .filter(move |(_, sensor)| sensor.file == file_key)
    }

    /// Timezone name declared by the nearest enclosing group of `path`
    /// (the node itself included when it is a group).
    pub fn timezone_name(&self, path: &str) -> Option<&str> {
        // ---
        std::iter::once(path)
            .chain(ancestors(path))
            .filter_map(|p| match self.sensors.get(p) {
                Some(SensorMapNode::Group(group)) => group
                    .attributes
                    .get(TIMEZONE_ATTRIBUTE)
                    .and_then(|tz| tz.as_str()),
                _ => None,
            })
            .next()
    }

    /// Resolved timezone for `path`, UTC when none is declared.
    pub fn timezone(&self, path: &str) -> Result<Tz, String> {
        // ---
        match self.timezone_name(path) {
            None => Ok(Tz::UTC),
            Some(name) => Tz::from_str(name).map_err(|_| format!("unknown timezone '{name}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde_json::json;

    fn sample_doc() -> serde_json::Value {
        json!({
            "version": 1,
            "files": {
                "0": {
                    "signature": {"headers": ["Date", "OAT", "Fan"]},
                    "timestamp": {"columns": ["Date"], "format": "%m/%d/%Y %H:%M"}
                }
            },
            "sensors": {
                "Site": {"level": "site", "attributes": {"timezone": "America/Los_Angeles"}},
                "Site/OAT": {"type": "OutdoorAirTemperature", "unit": "fahrenheit", "file": "0", "column": "OAT"},
                "Site/Fan": {"type": "SupplyFanStatus", "unit": null, "file": "0", "column": 2}
            }
        })
    }

    #[test]
    fn test_from_value_builds_typed_map() {
        // ---
        let map = SensorMap::from_value(sample_doc(), Catalog::builtin()).unwrap();
        assert_eq!(map.files.len(), 1);
        assert_eq!(map.sensor_nodes().count(), 2);
        let fan = map.sensor("Site/Fan").unwrap();
        assert_eq!(fan.column, ColumnRef::Index(2));
        assert_eq!(map.files["0"].timestamp.separator, " ");
    }

    #[test]
    fn test_timezone_from_nearest_group() {
        // ---
        let map = SensorMap::from_value(sample_doc(), Catalog::builtin()).unwrap();
        assert_eq!(map.timezone_name("Site/OAT"), Some("America/Los_Angeles"));
        assert_eq!(map.timezone("Site/OAT").unwrap(), chrono_tz::America::Los_Angeles);
    }

    #[test]
    fn test_resolve_column() {
        // ---
        let map = SensorMap::from_value(sample_doc(), Catalog::builtin()).unwrap();
        let file = &map.files["0"];
        assert_eq!(file.resolve_column(&ColumnRef::Name("OAT".into())), Some(1));
        assert_eq!(file.resolve_column(&ColumnRef::Index(3)), None);
        assert_eq!(file.resolve_column(&ColumnRef::Name("Missing".into())), None);
    }

    #[test]
    fn test_ancestors() {
        // ---
        let found: Vec<_> = ancestors("A/B/C").collect();
        assert_eq!(found, vec!["A/B", "A"]);
        assert_eq!(ancestors("A").count(), 0);
    }

    #[test]
    fn test_serialization_round_trips_through_validation() {
        // ---
        let map = SensorMap::from_value(sample_doc(), Catalog::builtin()).unwrap();
        assert!(map.validate(Catalog::builtin()).is_empty());
    }
}
