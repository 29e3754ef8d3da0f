//! Sensor-type catalog and unit table.
//!
//! The catalog is the closed registry of sensor kinds a sensor map may use.
//! Each kind carries its storage type, the unit family its `unit` must come
//! from, and optional bounds expressed in the family's base unit (the unit
//! with factor 1 and offset 0). Both tables are embedded at build time and
//! parsed once; the result is immutable for the lifetime of the process.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use serde::Deserialize;
use thiserror::Error;

use crate::models::StorageType;

const SENSORS_JSON: &str = include_str!("sensors.json");
const UNITS_JSON: &str = include_str!("units.json");

static BUILTIN: LazyLock<Catalog> = LazyLock::new(|| {
    Catalog::from_json(SENSORS_JSON, UNITS_JSON).expect("embedded sensor catalog is consistent")
});

// ---

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("invalid catalog document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("sensor type {sensor_type} references unknown unit family {family}")]
    UnknownFamily { sensor_type: String, family: String },

    #[error("unit {unit} in family {family} has a non-positive conversion factor")]
    BadFactor { family: String, unit: String },

    #[error("sensor type {0} has minimum greater than maximum")]
    InvertedBounds(String),
}

/// Linear conversion of a unit into its family's base unit.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct UnitDef {
    pub factor: f64,
    pub offset: f64,
}

impl UnitDef {
    pub fn to_base(&self, value: f64) -> f64 {
        value * self.factor + self.offset
    }

    pub fn from_base(&self, value: f64) -> f64 {
        (value - self.offset) / self.factor
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SensorTypeDef {
    pub name: String,
    pub storage_type: StorageType,
    /// `None` for dimensionless kinds (booleans, strings, datetimes), whose
    /// unit must be null.
    pub unit_family: Option<String>,
    pub minimum: Option<f64>,
    pub maximum: Option<f64>,
}

/// Inclusive numeric bounds in a concrete unit.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Bounds {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl Bounds {
    pub fn contains(&self, value: f64) -> bool {
        self.min.map_or(true, |min| value >= min) && self.max.map_or(true, |max| value <= max)
    }
}

#[derive(Deserialize)]
struct RawSensorType {
    data_type: StorageType,
    unit_type: Option<String>,
    #[serde(default)]
    minimum: Option<f64>,
    #[serde(default)]
    maximum: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct Catalog {
    sensor_types: BTreeMap<String, SensorTypeDef>,
    units: BTreeMap<String, BTreeMap<String, UnitDef>>,
}

impl Catalog {
    /// The catalog shipped with the crate.
    pub fn builtin() -> &'static Catalog {
        &BUILTIN
    }

    /// Parse a catalog from its two JSON documents and cross-check them.
    pub fn from_json(sensors: &str, units: &str) -> Result<Catalog, CatalogError> {
        // ---
        let raw: BTreeMap<String, RawSensorType> = serde_json::from_str(sensors)?;
        let units: BTreeMap<String, BTreeMap<String, UnitDef>> = serde_json::from_str(units)?;

        for (family, members) in &units {
            if let Some((unit, _)) = members.iter().find(|(_, def)| def.factor <= 0.0) {
                return Err(CatalogError::BadFactor {
                    family: family.clone(),
                    unit: unit.clone(),
                });
            }
        }

        let mut sensor_types = BTreeMap::new();
        for (name, def) in raw {
            if let Some(family) = &def.unit_type {
                if !units.contains_key(family) {
                    return Err(CatalogError::UnknownFamily {
                        sensor_type: name,
                        family: family.clone(),
                    });
                }
            }
            if let (Some(min), Some(max)) = (def.minimum, def.maximum) {
                if min > max {
                    return Err(CatalogError::InvertedBounds(name));
                }
            }
            sensor_types.insert(
                name.clone(),
                SensorTypeDef {
                    name,
                    storage_type: def.data_type,
                    unit_family: def.unit_type,
                    minimum: def.minimum,
                    maximum: def.maximum,
                },
            );
        }

        Ok(Catalog {
            sensor_types,
            units,
        })
    }

    pub fn sensor_type(&self, name: &str) -> Option<&SensorTypeDef> {
        self.sensor_types.get(name)
    }

    pub fn sensor_type_names(&self) -> impl Iterator<Item = &str> {
        self.sensor_types.keys().map(String::as_str)
    }

    pub fn unit_family(&self, family: &str) -> Option<&BTreeMap<String, UnitDef>> {
        self.units.get(family)
    }

    pub fn unit(&self, family: &str, unit: &str) -> Option<&UnitDef> {
        self.units.get(family).and_then(|members| members.get(unit))
    }

    /// Whether `unit` is acceptable for sensors of `sensor_type`.
    pub fn unit_allowed(&self, sensor_type: &str, unit: Option<&str>) -> bool {
        // ---
        let Some(def) = self.sensor_type(sensor_type) else {
            return false;
        };
        match (&def.unit_family, unit) {
            (None, None) => true,
            (None, Some(_)) | (Some(_), None) => false,
            (Some(family), Some(unit)) => self.unit(family, unit).is_some(),
        }
    }

    /// Range of valid raw values for a sensor of `sensor_type` reported in
    /// `unit`. Unknown types or units yield unbounded ranges.
    pub fn bounds(&self, sensor_type: &str, unit: Option<&str>) -> Bounds {
        // ---
        let Some(def) = self.sensor_type(sensor_type) else {
            return Bounds::default();
        };
        let conversion = match (&def.unit_family, unit) {
            (Some(family), Some(unit)) => self.unit(family, unit).copied(),
            _ => None,
        };
        let convert = |v: f64| conversion.map_or(v, |c| c.from_base(v));
        Bounds {
            min: def.minimum.map(convert),
            max: def.maximum.map(convert),
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_builtin_catalog_loads() {
        // ---
        let catalog = Catalog::builtin();
        let oat = catalog.sensor_type("OutdoorAirTemperature").unwrap();
        assert_eq!(oat.storage_type, StorageType::Float);
        assert_eq!(oat.unit_family.as_deref(), Some("temperature"));
        assert_eq!(
            catalog.sensor_type("SupplyFanStatus").unwrap().storage_type,
            StorageType::Boolean
        );
    }

    #[test]
    fn test_unit_membership() {
        // ---
        let catalog = Catalog::builtin();
        assert!(catalog.unit_allowed("OutdoorAirTemperature", Some("celsius")));
        assert!(!catalog.unit_allowed("OutdoorAirTemperature", Some("kilowatt")));
        assert!(!catalog.unit_allowed("OutdoorAirTemperature", None));
        assert!(catalog.unit_allowed("SupplyFanStatus", None));
        assert!(!catalog.unit_allowed("SupplyFanStatus", Some("percent")));
    }

    #[test]
    fn test_bounds_follow_unit() {
        // ---
        let catalog = Catalog::builtin();
        let f = catalog.bounds("OutdoorAirTemperature", Some("fahrenheit"));
        assert_eq!(f.min, Some(-100.0));
        assert_eq!(f.max, Some(200.0));

        let c = catalog.bounds("OutdoorAirTemperature", Some("celsius"));
        assert!((c.max.unwrap() - 93.333).abs() < 0.01);
        assert!(c.contains(30.0));
        assert!(!c.contains(150.0));
    }

    #[test]
    fn test_rejects_unknown_family() {
        // ---
        let sensors = r#"{"X": {"data_type": "float", "unit_type": "nope"}}"#;
        let err = Catalog::from_json(sensors, "{}").unwrap_err();
        assert!(matches!(err, CatalogError::UnknownFamily { .. }));
    }
}
