//! Lazy time series and the aggregation vocabulary shared by the store,
//! the filters and the merger.

use std::collections::BTreeMap;

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, Offset, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{Timestamp, Value};
use crate::parsers::localize;

/// One `(time, value)` sample.
pub type Sample = (Timestamp, Value);

/// Pull-based series of samples. Errors surface in-band so a consumer
/// can stop at the first one.
pub type TimeSeries = Box<dyn Iterator<Item = Result<Sample, QueryError>> + Send>;

// ---

#[derive(Debug, Clone, PartialEq, Error)]
pub enum QueryError {
    #[error("sensor {0} is not part of the bound sensor map")]
    MissingSensor(String),

    #[error("input group {0} is not bound")]
    MissingGroup(String),

    #[error("invalid predicate {key}: {message}")]
    BadPredicate { key: String, message: String },

    #[error("value {value} is not numeric")]
    NonNumeric { value: String },

    #[error("cannot compute {aggregate} over {value}")]
    BadAggregate { aggregate: Aggregate, value: String },

    #[error("interpolation target {target} is not strictly between {before} and {after}")]
    Misaligned {
        target: Timestamp,
        before: Timestamp,
        after: Timestamp,
    },

    #[error("timestamps went backwards: {current} after {previous}")]
    NonMonotonic {
        previous: Timestamp,
        current: Timestamp,
    },

    #[error("local time {time} does not exist for {topic}")]
    NonexistentLocalTime { topic: String, time: String },

    #[error("storage error: {0}")]
    Store(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregate {
    Sum,
    Avg,
    Max,
    Min,
    Count,
}

impl std::fmt::Display for Aggregate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Aggregate::Sum => "sum",
            Aggregate::Avg => "avg",
            Aggregate::Max => "max",
            Aggregate::Min => "min",
            Aggregate::Count => "count",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for Aggregate {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sum" => Ok(Aggregate::Sum),
            "avg" | "average" | "mean" => Ok(Aggregate::Avg),
            "max" => Ok(Aggregate::Max),
            "min" => Ok(Aggregate::Min),
            "count" => Ok(Aggregate::Count),
            other => Err(format!("unknown aggregate '{other}'")),
        }
    }
}

impl Aggregate {
    /// Reduce `values`. Only `Count` has a value for an empty input.
    /// Integer sums stay integers unless they overflow; averages are always
    /// floats.
    pub fn apply(&self, values: &[Value]) -> Result<Option<Value>, QueryError> {
        // ---
        if values.is_empty() && *self != Aggregate::Count {
            return Ok(None);
        }

        match self {
            Aggregate::Sum | Aggregate::Avg => {
                let numbers = values
                    .iter()
                    .map(|v| {
                        v.as_f64().ok_or_else(|| QueryError::BadAggregate {
                            aggregate: *self,
                            value: v.to_string(),
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                let total: f64 = numbers.iter().sum();
                if let Aggregate::Avg = self {
                    return Ok(Some(Value::Float(total / numbers.len() as f64)));
                }
                // An integer sum that overflows i64 falls back to the float total
                let exact = values.iter().try_fold(0i64, |acc, v| match v {
                    Value::Integer(i) => acc.checked_add(*i),
                    _ => None,
                });
                Ok(Some(exact.map_or(Value::Float(total), Value::Integer)))
            }
            Aggregate::Max | Aggregate::Min => {
                let want = if let Aggregate::Max = self {
                    std::cmp::Ordering::Greater
                } else {
                    std::cmp::Ordering::Less
                };
                let mut best = &values[0];
                for v in &values[1..] {
                    match v.partial_cmp(best) {
                        Some(ord) if ord == want => best = v,
                        Some(_) => {}
                        None => {
                            return Err(QueryError::BadAggregate {
                                aggregate: *self,
                                value: v.to_string(),
                            })
                        }
                    }
                }
                Ok(Some(best.clone()))
            }
            Aggregate::Count => Ok(Some(Value::Integer(values.len() as i64))),
        }
    }
}

/// Granularity for grouped queries. `All` collapses a whole column into
/// one scalar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TruncKind {
    Minute,
    Hour,
    Day,
    Month,
    Year,
    All,
}

impl std::str::FromStr for TruncKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "minute" => Ok(TruncKind::Minute),
            "hour" => Ok(TruncKind::Hour),
            "day" => Ok(TruncKind::Day),
            "month" => Ok(TruncKind::Month),
            "year" => Ok(TruncKind::Year),
            "all" => Ok(TruncKind::All),
            other => Err(format!("unknown truncation '{other}'")),
        }
    }
}

fn truncate_naive(local: NaiveDateTime, kind: TruncKind) -> NaiveDateTime {
    // ---
    let date = local.date();
    let start_of = |y: i32, m: u32, d: u32| {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap_or(date)
            .and_time(chrono::NaiveTime::MIN)
    };
    match kind {
        TruncKind::Minute => local.with_second(0).and_then(|t| t.with_nanosecond(0)).unwrap_or(local),
        TruncKind::Hour => date.and_hms_opt(local.hour(), 0, 0).unwrap_or(local),
        TruncKind::Day => date.and_time(chrono::NaiveTime::MIN),
        TruncKind::Month => start_of(date.year(), date.month(), 1),
        TruncKind::Year => start_of(date.year(), 1, 1),
        TruncKind::All => local,
    }
}

/// Truncate `t` to the start of its minute/hour/day/month/year as seen on
/// the wall clock of `tz`.
pub fn truncate(t: Timestamp, kind: TruncKind, tz: Tz) -> Timestamp {
    // ---
    let local = t.with_timezone(&tz);
    let naive = truncate_naive(local.naive_local(), kind);
    localize(naive, tz).unwrap_or_else(|| {
        // Bucket start falls in a DST gap; keep the offset in force at `t`.
        let offset = local.offset().fix().local_minus_utc();
        Utc.from_utc_datetime(&(naive - Duration::seconds(i64::from(offset))))
    })
}

/// Group samples into truncated buckets and reduce each with `aggregate`.
/// Output is sorted by bucket start.
pub fn group_by<I>(samples: I, kind: TruncKind, tz: Tz, aggregate: Aggregate) -> Result<Vec<Sample>, QueryError>
where
    I: IntoIterator<Item = Result<Sample, QueryError>>,
{
    // ---
    let mut buckets: BTreeMap<Timestamp, Vec<Value>> = BTreeMap::new();
    for sample in samples {
        let (t, v) = sample?;
        buckets.entry(truncate(t, kind, tz)).or_default().push(v);
    }

    let mut out = Vec::with_capacity(buckets.len());
    for (t, values) in buckets {
        if let Some(v) = aggregate.apply(&values)? {
            out.push((t, v));
        }
    }
    Ok(out)
}

pub fn from_samples(samples: Vec<Sample>) -> TimeSeries {
    Box::new(samples.into_iter().map(Ok))
}

pub fn collect_series(series: TimeSeries) -> Result<Vec<Sample>, QueryError> {
    series.collect()
}

/// Adapter that fails the series if timestamps ever decrease.
pub struct Monotonic<I> {
    inner: I,
    last: Option<Timestamp>,
    failed: bool,
}

impl<I> Monotonic<I> {
    pub fn new(inner: I) -> Self {
        Self {
            inner,
            last: None,
            failed: false,
        }
    }
}

impl<I> Iterator for Monotonic<I>
where
    I: Iterator<Item = Result<Sample, QueryError>>,
{
    type Item = Result<Sample, QueryError>;

    fn next(&mut self) -> Option<Self::Item> {
        // ---
        if self.failed {
            return None;
        }
        let item = self.inner.next()?;
        if let Ok((t, _)) = &item {
            if let Some(previous) = self.last {
                if *t < previous {
                    self.failed = true;
                    return Some(Err(QueryError::NonMonotonic {
                        previous,
                        current: *t,
                    }));
                }
            }
            self.last = Some(*t);
        } else {
            self.failed = true;
        }
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2014, 6, 1, h, m, 0).unwrap()
    }

    #[test]
    fn test_aggregates() {
        // ---
        let values = vec![Value::Integer(1), Value::Integer(2), Value::Integer(6)];
        assert_eq!(Aggregate::Sum.apply(&values).unwrap(), Some(Value::Integer(9)));
        assert_eq!(Aggregate::Avg.apply(&values).unwrap(), Some(Value::Float(3.0)));
        assert_eq!(Aggregate::Max.apply(&values).unwrap(), Some(Value::Integer(6)));
        assert_eq!(Aggregate::Min.apply(&values).unwrap(), Some(Value::Integer(1)));
        assert_eq!(Aggregate::Count.apply(&values).unwrap(), Some(Value::Integer(3)));
        assert_eq!(Aggregate::Sum.apply(&[]).unwrap(), None);
        assert_eq!(Aggregate::Count.apply(&[]).unwrap(), Some(Value::Integer(0)));
    }

    #[test]
    fn test_integer_sum_overflow_becomes_float() {
        // ---
        let values = [Value::Integer(i64::MAX), Value::Integer(1)];
        assert_eq!(Aggregate::Sum.apply(&values).unwrap(), Some(Value::Float(i64::MAX as f64 + 1.0)));
        let mixed = [Value::Integer(2), Value::Float(0.5)];
        assert_eq!(Aggregate::Sum.apply(&mixed).unwrap(), Some(Value::Float(2.5)));
    }

    #[test]
    fn test_sum_of_strings_fails() {
        // ---
        let err = Aggregate::Sum.apply(&[Value::from("a")]).unwrap_err();
        assert!(matches!(err, QueryError::BadAggregate { .. }));
    }

    #[test]
    fn test_group_by_hour_average() {
        // ---
        let samples = vec![
            Ok((at(9, 0), Value::Float(10.0))),
            Ok((at(9, 30), Value::Float(20.0))),
            Ok((at(10, 0), Value::Float(30.0))),
        ];
        let grouped = group_by(samples, TruncKind::Hour, Tz::UTC, Aggregate::Avg).unwrap();
        assert_eq!(
            grouped,
            vec![(at(9, 0), Value::Float(15.0)), (at(10, 0), Value::Float(30.0))]
        );
    }

    #[test]
    fn test_truncate_day_in_timezone() {
        // ---
        // 03:00 UTC on June 1st is still May 31st in Los Angeles (UTC-7).
        let t = Utc.with_ymd_and_hms(2014, 6, 1, 3, 0, 0).unwrap();
        let day = truncate(t, TruncKind::Day, chrono_tz::America::Los_Angeles);
        assert_eq!(day, Utc.with_ymd_and_hms(2014, 5, 31, 7, 0, 0).unwrap());

        let month = truncate(t, TruncKind::Month, Tz::UTC);
        assert_eq!(month, Utc.with_ymd_and_hms(2014, 6, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_monotonic_adapter() {
        // ---
        let series = vec![
            Ok((at(9, 0), Value::Integer(1))),
            Ok((at(9, 0), Value::Integer(2))),
            Ok((at(8, 0), Value::Integer(3))),
            Ok((at(10, 0), Value::Integer(4))),
        ];
        let out: Vec<_> = Monotonic::new(series.into_iter()).collect();
        assert_eq!(out.len(), 3);
        assert!(matches!(out[2], Err(QueryError::NonMonotonic { .. })));
    }
}
