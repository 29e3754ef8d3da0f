//! Two-phase sensor-map validation.
//!
//! Phase one walks the raw JSON and checks shape, required properties,
//! types, enumerations and sensor paths; it stops at the first problem
//! because the cross-reference checks need a well-formed document. Phase
//! two checks that every column, file and unit reference resolves and
//! collects every failure it finds.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use super::{SensorMap, SENSOR_MAP_VERSION};
use crate::catalog::Catalog;

static SENSOR_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([^/]+)(/[^/]+)*$").expect("sensor path pattern compiles"));

const GROUP_LEVELS: [&str; 4] = ["site", "building", "system", "other"];

// ---

/// One step of the path that locates a node in the document.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Key(key) => write!(f, "{key:?}"),
            PathSegment::Index(i) => write!(f, "{i}"),
        }
    }
}

impl From<&str> for PathSegment {
    fn from(key: &str) -> Self {
        PathSegment::Key(key.to_string())
    }
}

impl From<usize> for PathSegment {
    fn from(i: usize) -> Self {
        PathSegment::Index(i)
    }
}

/// Validation result: document path to the messages reported there. Empty
/// means the document is valid.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaErrors(BTreeMap<Vec<PathSegment>, Vec<String>>);

impl SchemaErrors {
    pub fn single(path: Vec<PathSegment>, message: impl Into<String>) -> Self {
        let mut errors = SchemaErrors::default();
        errors.push(path, message);
        errors
    }

    pub fn push(&mut self, path: Vec<PathSegment>, message: impl Into<String>) {
        self.0.entry(path).or_default().push(message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn get(&self, path: &[PathSegment]) -> Option<&[String]> {
        self.0.get(path).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[PathSegment], &[String])> {
        self.0.iter().map(|(p, m)| (p.as_slice(), m.as_slice()))
    }
}

impl fmt::Display for SchemaErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        let mut first = true;
        for (path, messages) in &self.0 {
            for message in messages {
                if !first {
                    f.write_str("; ")?;
                }
                first = false;
                let rendered: Vec<String> = path.iter().map(ToString::to_string).collect();
                write!(f, "[{}]: {}", rendered.join(", "), message)?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for SchemaErrors {}

/// Build a path from literal segments: `path!["files", key, "timestamp"]`.
macro_rules! path {
    ($($seg:expr),* $(,)?) => {
        vec![$(PathSegment::from($seg)),*]
    };
}

type Structural = Result<(), (Vec<PathSegment>, String)>;

/// Validate a sensor-map document. Returns an empty map when it is valid.
pub fn validate(doc: &Value, catalog: &Catalog) -> SchemaErrors {
    // ---
    if let Err((path, message)) = check_structure(doc, catalog) {
        return SchemaErrors::single(path, message);
    }
    match serde_json::from_value::<SensorMap>(doc.clone()) {
        Ok(map) => check_references(&map, catalog),
        Err(e) => SchemaErrors::single(Vec::new(), e.to_string()),
    }
}

// --- phase one

fn child(path: &[PathSegment], seg: impl Into<PathSegment>) -> Vec<PathSegment> {
    let mut next = path.to_vec();
    next.push(seg.into());
    next
}

fn as_object<'a>(value: &'a Value, path: &[PathSegment]) -> Result<&'a Map<String, Value>, (Vec<PathSegment>, String)> {
    value
        .as_object()
        .ok_or_else(|| (path.to_vec(), format!("expected an object, found {}", kind(value))))
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn check_properties(
    obj: &Map<String, Value>,
    path: &[PathSegment],
    required: &[&str],
    allowed: &[&str],
) -> Structural {
    // ---
    if let Some(missing) = required.iter().find(|key| !obj.contains_key(**key)) {
        return Err((child(path, *missing), "required property is missing".to_string()));
    }
    if let Some(extra) = obj.keys().find(|key| !allowed.contains(&key.as_str())) {
        return Err((child(path, extra.as_str()), "unexpected property".to_string()));
    }
    Ok(())
}

fn check_column_ref(value: &Value, path: Vec<PathSegment>) -> Structural {
    match value {
        Value::String(_) => Ok(()),
        Value::Number(n) if n.as_u64().is_some() => Ok(()),
        other => Err((
            path,
            format!("expected a header name or non-negative index, found {}", kind(other)),
        )),
    }
}

fn check_structure(doc: &Value, catalog: &Catalog) -> Structural {
    // ---
    let root = as_object(doc, &[])?;
    let keys = ["version", "files", "sensors"];
    check_properties(root, &[], &keys, &keys)?;

    if root["version"].as_u64() != Some(SENSOR_MAP_VERSION) {
        return Err((path!["version"], format!("version must be {SENSOR_MAP_VERSION}")));
    }

    let files = as_object(&root["files"], &path!["files"])?;
    for (key, spec) in files {
        check_file(spec, &path!["files", key.as_str()])?;
    }

    let sensors = as_object(&root["sensors"], &path!["sensors"])?;
    for (name, node) in sensors {
        let node_path = path!["sensors", name.as_str()];
        if !SENSOR_PATH.is_match(name) {
            return Err((node_path, format!("{name:?} is not a valid sensor path")));
        }
        check_node(node, &node_path, catalog)?;
    }
    Ok(())
}

fn check_file(spec: &Value, path: &[PathSegment]) -> Structural {
    // ---
    let spec = as_object(spec, path)?;
    check_properties(spec, path, &["signature", "timestamp"], &["signature", "timestamp"])?;

    let sig_path = child(path, "signature");
    let signature = as_object(&spec["signature"], &sig_path)?;
    check_properties(signature, &sig_path, &["headers"], &["headers"])?;
    let headers_path = child(&sig_path, "headers");
    let headers = signature["headers"]
        .as_array()
        .ok_or_else(|| (headers_path.clone(), "expected an array".to_string()))?;
    if headers.len() < 2 {
        return Err((headers_path, "at least 2 headers are required".to_string()));
    }
    for (i, header) in headers.iter().enumerate() {
        if !(header.is_string() || header.is_null()) {
            return Err((child(&headers_path, i), format!("expected string or null, found {}", kind(header))));
        }
    }

    let ts_path = child(path, "timestamp");
    let timestamp = as_object(&spec["timestamp"], &ts_path)?;
    check_properties(timestamp, &ts_path, &["columns"], &["columns", "format", "separator"])?;
    let columns_path = child(&ts_path, "columns");
    let columns = timestamp["columns"]
        .as_array()
        .ok_or_else(|| (columns_path.clone(), "expected an array".to_string()))?;
    if columns.is_empty() {
        return Err((columns_path, "at least 1 timestamp column is required".to_string()));
    }
    for (i, column) in columns.iter().enumerate() {
        check_column_ref(column, child(&columns_path, i))?;
        if columns[..i].contains(column) {
            return Err((child(&columns_path, i), "timestamp columns must be unique".to_string()));
        }
    }
    for key in ["format", "separator"] {
        if let Some(value) = timestamp.get(key) {
            if !value.is_string() {
                return Err((child(&ts_path, key), format!("expected a string, found {}", kind(value))));
            }
        }
    }
    Ok(())
}

fn check_node(node: &Value, path: &[PathSegment], catalog: &Catalog) -> Structural {
    // ---
    let obj = as_object(node, path)?;

    if obj.contains_key("level") {
        check_properties(obj, path, &["level"], &["level", "attributes"])?;
        let level = obj["level"].as_str().unwrap_or_default();
        if !GROUP_LEVELS.contains(&level) {
            return Err((
                child(path, "level"),
                format!("level must be one of {}", GROUP_LEVELS.join(", ")),
            ));
        }
        if let Some(attributes) = obj.get("attributes") {
            as_object(attributes, &child(path, "attributes"))?;
        }
        return Ok(());
    }

    check_properties(obj, path, &["type", "file", "column"], &["type", "unit", "file", "column"])?;
    match obj["type"].as_str() {
        Some(name) if catalog.sensor_type(name).is_some() => {}
        Some(name) => return Err((child(path, "type"), format!("unknown sensor type {name:?}"))),
        None => return Err((child(path, "type"), "expected a string".to_string())),
    }
    if let Some(unit) = obj.get("unit") {
        if !(unit.is_string() || unit.is_null()) {
            return Err((child(path, "unit"), format!("expected string or null, found {}", kind(unit))));
        }
    }
    if !obj["file"].is_string() {
        return Err((child(path, "file"), "expected a string".to_string()));
    }
    check_column_ref(&obj["column"], child(path, "column"))
}

// --- phase two

fn check_references(map: &SensorMap, catalog: &Catalog) -> SchemaErrors {
    // ---
    let mut errors = SchemaErrors::default();

    for (key, file) in &map.files {
        for (i, column) in file.timestamp.columns.iter().enumerate() {
            if file.resolve_column(column).is_none() {
                errors.push(
                    path!["files", key.as_str(), "timestamp", "columns", i],
                    format!("column {column} does not match any header"),
                );
            }
        }
    }

    let mut used = HashSet::new();
    for (name, sensor) in map.sensor_nodes() {
        match map.files.get(&sensor.file) {
            None => errors.push(
                path!["sensors", name, "file"],
                format!("file {:?} is not defined", sensor.file),
            ),
            Some(file) => {
                used.insert(sensor.file.as_str());
                if file.resolve_column(&sensor.column).is_none() {
                    errors.push(
                        path!["sensors", name, "column"],
                        format!("column {} does not match any header", sensor.column),
                    );
                }
            }
        }

        if !catalog.unit_allowed(&sensor.sensor_type, sensor.unit.as_deref()) {
            let family = catalog
                .sensor_type(&sensor.sensor_type)
                .and_then(|def| def.unit_family.clone());
            let message = match (family, &sensor.unit) {
                (None, Some(unit)) => {
                    format!("{} takes no unit, found {unit:?}", sensor.sensor_type)
                }
                (Some(family), None) => format!("a {family} unit is required"),
                (Some(family), Some(unit)) => format!("{unit:?} is not a {family} unit"),
                (None, None) => format!("unknown sensor type {:?}", sensor.sensor_type),
            };
            errors.push(path!["sensors", name, "unit"], message);
        }
    }

    for key in map.files.keys() {
        if !used.contains(key.as_str()) {
            errors.push(path!["files", key.as_str()], "file is not used by any sensor");
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde_json::json;

    fn doc() -> Value {
        json!({
            "version": 1,
            "files": {
                "a": {
                    "signature": {"headers": ["Date", "OAT", null]},
                    "timestamp": {"columns": ["Date"]}
                }
            },
            "sensors": {
                "Site": {"level": "site"},
                "Site/OAT": {"type": "OutdoorAirTemperature", "unit": "celsius", "file": "a", "column": "OAT"}
            }
        })
    }

    #[test]
    fn test_valid_document() {
        // ---
        assert!(validate(&doc(), Catalog::builtin()).is_empty());
    }

    #[test]
    fn test_missing_required_property() {
        // ---
        let mut d = doc();
        d["files"]["a"]["timestamp"].as_object_mut().unwrap().remove("columns");
        let errors = validate(&d, Catalog::builtin());
        assert_eq!(errors.len(), 1);
        assert!(errors
            .get(&path!["files", "a", "timestamp", "columns"])
            .is_some());
    }

    #[test]
    fn test_structural_error_aborts_before_references() {
        // ---
        let mut d = doc();
        d["sensors"]["Site/OAT"]["file"] = json!("missing");
        d["sensors"]["//bad"] = json!({"level": "site"});
        let errors = validate(&d, Catalog::builtin());
        assert_eq!(errors.len(), 1);
        assert!(errors.get(&path!["sensors", "//bad"]).is_some());
    }

    #[test]
    fn test_short_signature_rejected() {
        // ---
        let mut d = doc();
        d["files"]["a"]["signature"]["headers"] = json!(["Date"]);
        let errors = validate(&d, Catalog::builtin());
        assert!(errors.get(&path!["files", "a", "signature", "headers"]).is_some());
    }

    #[test]
    fn test_unknown_sensor_type_is_structural() {
        // ---
        let mut d = doc();
        d["sensors"]["Site/OAT"]["type"] = json!("Flux");
        let errors = validate(&d, Catalog::builtin());
        assert!(errors.get(&path!["sensors", "Site/OAT", "type"]).is_some());
    }

    #[test]
    fn test_reference_errors_are_collected() {
        // ---
        let mut d = doc();
        d["files"]["b"] = json!({
            "signature": {"headers": ["T", "V"]},
            "timestamp": {"columns": [5]}
        });
        d["sensors"]["Site/OAT"]["column"] = json!("Nope");
        d["sensors"]["Site/OAT"]["unit"] = json!("kilowatt");
        let errors = validate(&d, Catalog::builtin());

        assert!(errors.get(&path!["sensors", "Site/OAT", "column"]).is_some());
        assert!(errors.get(&path!["sensors", "Site/OAT", "unit"]).is_some());
        assert!(errors.get(&path!["files", "b", "timestamp", "columns", 0usize]).is_some());
        assert!(errors.get(&path!["files", "b"]).is_some());
        assert_eq!(errors.len(), 4);
    }

    #[test]
    fn test_undefined_file_reference() {
        // ---
        let mut d = doc();
        d["sensors"]["Site/Other"] = json!({
            "type": "ZoneTemperature", "unit": "fahrenheit", "file": "zz", "column": 1
        });
        let errors = validate(&d, Catalog::builtin());
        assert_eq!(
            errors.get(&path!["sensors", "Site/Other", "file"]).unwrap(),
            &["file \"zz\" is not defined".to_string()]
        );
    }

    #[test]
    fn test_index_column_reference() {
        // ---
        let mut d = doc();
        d["sensors"]["Site/OAT"]["column"] = json!(1);
        assert!(validate(&d, Catalog::builtin()).is_empty());
        d["sensors"]["Site/OAT"]["column"] = json!(3);
        assert!(!validate(&d, Catalog::builtin()).is_empty());
    }
}
