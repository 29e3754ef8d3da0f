//! Query builder over one sensor column.
//!
//! Predicates use Django-style keys, `<field>__<lookup>`, with `time` and
//! `value` as fields and `exact`, `lt`, `lte`, `gt`, `gte` as lookups. A
//! bare field name means `exact`.

use std::cmp::Ordering;
use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::models::{Timestamp, Value};
use crate::timeseries::{group_by, Aggregate, QueryError, Sample, TimeSeries, TruncKind};

use super::SensorRecord;

// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Time,
    Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Exact,
    Lt,
    Lte,
    Gt,
    Gte,
}

impl Lookup {
    fn accepts(&self, ord: Ordering) -> bool {
        match self {
            Lookup::Exact => ord == Ordering::Equal,
            Lookup::Lt => ord == Ordering::Less,
            Lookup::Lte => ord != Ordering::Greater,
            Lookup::Gt => ord == Ordering::Greater,
            Lookup::Gte => ord != Ordering::Less,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub field: Field,
    pub lookup: Lookup,
    pub operand: Value,
}

impl Predicate {
    /// Parse `key` (e.g. `time__gte`) with its operand. Time operands may be
    /// given as RFC 3339 strings.
    pub fn parse(key: &str, operand: Value) -> Result<Predicate, QueryError> {
        // ---
        let bad = |message: &str| QueryError::BadPredicate {
            key: key.to_string(),
            message: message.to_string(),
        };

        let (field, lookup) = key.split_once("__").unwrap_or((key, "exact"));
        let field = match field {
            "time" => Field::Time,
            "value" => Field::Value,
            _ => return Err(bad("field must be time or value")),
        };
        let lookup = match lookup {
            "exact" => Lookup::Exact,
            "lt" => Lookup::Lt,
            "lte" => Lookup::Lte,
            "gt" => Lookup::Gt,
            "gte" => Lookup::Gte,
            _ => return Err(bad("lookup must be one of exact, lt, lte, gt, gte")),
        };

        let operand = match (field, operand) {
            (Field::Time, Value::String(s)) => DateTime::parse_from_rfc3339(&s)
                .map(|t| Value::Datetime(t.with_timezone(&Utc)))
                .map_err(|_| bad("time operand is not an RFC 3339 timestamp"))?,
            (Field::Time, v @ Value::Datetime(_)) => v,
            (Field::Time, _) => return Err(bad("time operand must be a timestamp")),
            (Field::Value, v) => v,
        };

        Ok(Predicate {
            field,
            lookup,
            operand,
        })
    }

    pub fn time(lookup: Lookup, t: Timestamp) -> Predicate {
        Predicate {
            field: Field::Time,
            lookup,
            operand: Value::Datetime(t),
        }
    }

    pub fn value(lookup: Lookup, operand: impl Into<Value>) -> Predicate {
        Predicate {
            field: Field::Value,
            lookup,
            operand: operand.into(),
        }
    }

    /// Incomparable operands never match.
    pub fn matches(&self, sample: &Sample) -> bool {
        // ---
        let ord = match self.field {
            Field::Time => self.operand.as_timestamp().map(|t| sample.0.cmp(&t)),
            Field::Value => sample.1.partial_cmp(&self.operand),
        };
        ord.is_some_and(|ord| self.lookup.accepts(ord))
    }
}

/// Sort key for query results. Sorting is stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderBy {
    #[default]
    Time,
    Value,
}

impl FromStr for OrderBy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "time" => Ok(OrderBy::Time),
            "value" => Ok(OrderBy::Value),
            other => Err(format!("cannot order by '{other}'")),
        }
    }
}

/// Result of [`SensorQuery::timeseries`].
pub enum SeriesResult {
    Series(TimeSeries),
    Scalar(Option<Value>),
}

impl SeriesResult {
    /// Materialize a series result; scalars yield `None`.
    pub fn into_samples(self) -> Result<Option<Vec<Sample>>, QueryError> {
        match self {
            SeriesResult::Series(series) => series.collect::<Result<Vec<_>, _>>().map(Some),
            SeriesResult::Scalar(_) => Ok(None),
        }
    }
}

/// Filtered, ordered view of one sensor column.
#[derive(Debug, Clone)]
pub struct SensorQuery {
    sensor: SensorRecord,
    samples: Vec<Sample>,
    include: Vec<Predicate>,
    exclude: Vec<Predicate>,
    order_by: OrderBy,
}

impl SensorQuery {
    pub(crate) fn new(sensor: SensorRecord, samples: Vec<Sample>) -> Self {
        Self {
            sensor,
            samples,
            include: Vec::new(),
            exclude: Vec::new(),
            order_by: OrderBy::Time,
        }
    }

    pub fn sensor(&self) -> &SensorRecord {
        &self.sensor
    }

    /// Keep samples matching every predicate added this way.
    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.include.push(predicate);
        self
    }

    /// Drop samples matching every predicate added this way.
    pub fn exclude(mut self, predicate: Predicate) -> Self {
        self.exclude.push(predicate);
        self
    }

    pub fn order_by(mut self, order_by: OrderBy) -> Self {
        self.order_by = order_by;
        self
    }

    fn selected(self) -> Vec<Sample> {
        // ---
        let SensorQuery {
            mut samples,
            include,
            exclude,
            order_by,
            ..
        } = self;

        samples.retain(|s| {
            include.iter().all(|p| p.matches(s))
                && (exclude.is_empty() || !exclude.iter().all(|p| p.matches(s)))
        });
        match order_by {
            OrderBy::Time => samples.sort_by_key(|(t, _)| *t),
            OrderBy::Value => samples.sort_by(|a, b| a.1.total_cmp(&b.1)),
        }
        samples
    }

    /// Lazy `(time, value)` series in the requested order.
    pub fn into_series(self) -> TimeSeries {
        Box::new(self.selected().into_iter().map(Ok))
    }

    /// Plain series when `trunc` is `None`, grouped and aggregated series
    /// for a calendar truncation, one scalar for [`TruncKind::All`].
    /// Truncation follows the sensor's timezone.
    pub fn timeseries(self, trunc: Option<TruncKind>, aggregate: Aggregate) -> Result<SeriesResult, QueryError> {
        // ---
        let tz = self.sensor.timezone;
        match trunc {
            None => Ok(SeriesResult::Series(self.into_series())),
            Some(TruncKind::All) => {
                let values: Vec<Value> = self.selected().into_iter().map(|(_, v)| v).collect();
                Ok(SeriesResult::Scalar(aggregate.apply(&values)?))
            }
            Some(kind) => {
                let grouped = group_by(self.selected().into_iter().map(Ok), kind, tz, aggregate)?;
                Ok(SeriesResult::Series(Box::new(grouped.into_iter().map(Ok))))
            }
        }
    }
}
