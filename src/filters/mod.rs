//! Series filters.
//!
//! Three shapes of transform over a [`TimeSeries`]:
//! - per-sample rules (`round`, `scale`) that keep the sample rate;
//! - normalizers (`linear_interpolation`, `fill`) that resample onto a
//!   fixed period aligned to the first sample's day;
//! - period aggregators (`sum`, `average`).
//!
//! Every filter checks that its input timestamps never decrease.

use std::collections::VecDeque;

use chrono::{Duration, NaiveTime, TimeZone, Utc};
use serde_json::{Map, Value as Json};

use crate::models::{StorageType, Timestamp, Value};
use crate::timeseries::{Aggregate, Monotonic, QueryError, Sample, TimeSeries};

mod pipeline;

pub use pipeline::{FilterConfigError, FilterEntry, FilterPipeline, SensorPlan};

/// Names accepted in filter configurations.
pub const FILTER_NAMES: [&str; 7] = [
    "round",
    "scale",
    "linear_interpolation",
    "fill",
    "repeat_previous",
    "sum",
    "average",
];

// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalizeMode {
    LinearInterpolation,
    Fill,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Round { places: i32 },
    Scale { factor: f64, offset: f64 },
    Normalize {
        mode: NormalizeMode,
        period: Duration,
        drop_extra: bool,
    },
    Aggregate { aggregate: Aggregate, period: Duration },
}

fn param_f64(params: &Map<String, Json>, name: &str, default: Option<f64>) -> Result<f64, String> {
    match params.get(name) {
        Some(v) => v.as_f64().ok_or_else(|| format!("{name} must be a number")),
        None => default.ok_or_else(|| format!("{name} is required")),
    }
}

fn param_period(params: &Map<String, Json>) -> Result<Duration, String> {
    // ---
    match params.get("period_seconds") {
        None => Err("period_seconds is required".to_string()),
        Some(v) => match v.as_i64() {
            Some(secs) if secs > 0 => Ok(Duration::seconds(secs)),
            _ => Err("period_seconds must be a positive integer".to_string()),
        },
    }
}

impl Filter {
    /// Build a filter from its registered name and JSON parameters.
    pub fn from_config(name: &str, params: &Map<String, Json>) -> Result<Filter, String> {
        // ---
        let allowed: &[&str] = match name {
            "round" => &["places"],
            "scale" => &["factor", "offset"],
            "linear_interpolation" | "fill" | "repeat_previous" => &["period_seconds", "drop_extra"],
            "sum" | "average" => &["period_seconds"],
            other => return Err(format!("unknown filter '{other}'")),
        };
        if let Some(extra) = params.keys().find(|k| !allowed.contains(&k.as_str())) {
            return Err(format!("unexpected parameter {extra} for {name}"));
        }

        let drop_extra = match params.get("drop_extra") {
            None => true,
            Some(v) => v.as_bool().ok_or("drop_extra must be a boolean")?,
        };
        let filter = match name {
            "round" => {
                let places = match params.get("places") {
                    None => 0,
                    Some(v) => v
                        .as_i64()
                        .and_then(|p| i32::try_from(p).ok())
                        .ok_or("places must be an integer")?,
                };
                Filter::Round { places }
            }
            "scale" => Filter::Scale {
                factor: param_f64(params, "factor", Some(1.0))?,
                offset: param_f64(params, "offset", Some(0.0))?,
            },
            "linear_interpolation" => Filter::Normalize {
                mode: NormalizeMode::LinearInterpolation,
                period: param_period(params)?,
                drop_extra,
            },
            "fill" | "repeat_previous" => Filter::Normalize {
                mode: NormalizeMode::Fill,
                period: param_period(params)?,
                drop_extra,
            },
            "sum" => Filter::Aggregate {
                aggregate: Aggregate::Sum,
                period: param_period(params)?,
            },
            _ => Filter::Aggregate {
                aggregate: Aggregate::Avg,
                period: param_period(params)?,
            },
        };
        Ok(filter)
    }

    /// Whether the filter can run over values of `input`.
    pub fn accepts(&self, input: StorageType) -> bool {
        match self {
            Filter::Normalize {
                mode: NormalizeMode::Fill,
                ..
            } => true,
            _ => !matches!(input, StorageType::String | StorageType::Datetime),
        }
    }

    /// Storage type of the values this filter produces from `input`.
    pub fn output_type(&self, input: StorageType) -> StorageType {
        match self {
            Filter::Normalize {
                mode: NormalizeMode::Fill,
                ..
            } => input,
            Filter::Aggregate {
                aggregate: Aggregate::Sum,
                ..
            } if input == StorageType::Integer => StorageType::Integer,
            _ => StorageType::Float,
        }
    }

    pub fn apply(&self, series: TimeSeries) -> TimeSeries {
        // ---
        let input = Monotonic::new(series);
        match self.clone() {
            Filter::Round { places } => {
                let scale = 10f64.powi(places);
                Box::new(input.map(move |s| -> Result<Sample, QueryError> {
                    let (t, v) = s?;
                    Ok((t, Value::Float((numeric(&v)? * scale).round() / scale)))
                }))
            }
            Filter::Scale { factor, offset } => Box::new(input.map(move |s| -> Result<Sample, QueryError> {
                let (t, v) = s?;
                Ok((t, Value::Float(numeric(&v)? * factor + offset)))
            })),
            Filter::Normalize {
                mode,
                period,
                drop_extra,
            } => Box::new(Normalize::new(input, mode, period, drop_extra)),
            Filter::Aggregate { aggregate, period } => Box::new(PeriodAggregate::new(input, aggregate, period)),
        }
    }
}

fn numeric(v: &Value) -> Result<f64, QueryError> {
    v.as_f64().ok_or_else(|| QueryError::NonNumeric { value: v.to_string() })
}

fn utc_midnight(t: Timestamp) -> Timestamp {
    Utc.from_utc_datetime(&t.date_naive().and_time(NaiveTime::MIN))
}

/// First multiple of `period` past the UTC midnight of `t` that is at
/// or after `t`.
pub fn align_up(t: Timestamp, period: Duration) -> Timestamp {
    // ---
    let midnight = utc_midnight(t);
    let offset = (t - midnight).num_microseconds().unwrap_or(0);
    let step = period.num_microseconds().unwrap_or(1).max(1);
    let rem = offset % step;
    if rem == 0 {
        t
    } else {
        t + Duration::microseconds(step - rem)
    }
}

/// Start of the period containing `t`, counted from `origin`.
fn period_start(t: Timestamp, origin: Timestamp, period: Duration) -> Timestamp {
    // ---
    let step = period.num_microseconds().unwrap_or(1).max(1);
    let offset = (t - origin).num_microseconds().unwrap_or(0);
    origin + Duration::microseconds(offset.div_euclid(step) * step)
}

/// Resampler onto `origin + k * period`.
pub struct Normalize<I> {
    inner: I,
    mode: NormalizeMode,
    period: Duration,
    drop_extra: bool,
    prev: Option<Sample>,
    target: Option<Timestamp>,
    out: VecDeque<Result<Sample, QueryError>>,
    done: bool,
}

impl<I> Normalize<I>
where
    I: Iterator<Item = Result<Sample, QueryError>>,
{
    pub fn new(inner: I, mode: NormalizeMode, period: Duration, drop_extra: bool) -> Self {
        Self {
            inner,
            mode,
            period,
            drop_extra,
            prev: None,
            target: None,
            out: VecDeque::new(),
            done: false,
        }
    }

    fn value_at(&self, target: Timestamp, next: &Sample) -> Result<Value, QueryError> {
        // ---
        let Some((t0, v0)) = &self.prev else {
            return Err(QueryError::Misaligned {
                target,
                before: next.0,
                after: next.0,
            });
        };
        if !(*t0 < target && target < next.0) {
            return Err(QueryError::Misaligned {
                target,
                before: *t0,
                after: next.0,
            });
        }
        match self.mode {
            NormalizeMode::Fill => Ok(v0.clone()),
            NormalizeMode::LinearInterpolation => {
                let (y0, y1) = (numeric(v0)?, numeric(&next.1)?);
                let span = (next.0 - *t0).num_microseconds().unwrap_or(1) as f64;
                let part = (target - *t0).num_microseconds().unwrap_or(0) as f64;
                Ok(Value::Float(y0 + (y1 - y0) * part / span))
            }
        }
    }

    fn push_sample(&mut self, sample: Sample) -> Result<(), QueryError> {
        // ---
        let mut target = match self.target {
            Some(t) => t,
            None => align_up(sample.0, self.period),
        };

        let mut exact = false;
        while target <= sample.0 {
            if target == sample.0 {
                self.out.push_back(Ok(sample.clone()));
                exact = true;
            } else {
                let value = self.value_at(target, &sample)?;
                self.out.push_back(Ok((target, value)));
            }
            target += self.period;
        }
        if !exact && !self.drop_extra {
            self.out.push_back(Ok(sample.clone()));
        }

        self.target = Some(target);
        self.prev = Some(sample);
        Ok(())
    }
}

impl<I> Iterator for Normalize<I>
where
    I: Iterator<Item = Result<Sample, QueryError>>,
{
    type Item = Result<Sample, QueryError>;

    fn next(&mut self) -> Option<Self::Item> {
        // ---
        loop {
            if let Some(item) = self.out.pop_front() {
                return Some(item);
            }
            if self.done {
                return None;
            }
            match self.inner.next() {
                None => self.done = true,
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e));
                }
                Some(Ok(sample)) => {
                    if let Err(e) = self.push_sample(sample) {
                        self.done = true;
                        self.out.clear();
                        return Some(Err(e));
                    }
                }
            }
        }
    }
}

/// One sample per non-empty period, stamped with the period start.
pub struct PeriodAggregate<I> {
    inner: I,
    aggregate: Aggregate,
    period: Duration,
    origin: Option<Timestamp>,
    bucket: Option<(Timestamp, Vec<Value>)>,
    done: bool,
}

impl<I> PeriodAggregate<I> {
    pub fn new(inner: I, aggregate: Aggregate, period: Duration) -> Self {
        Self {
            inner,
            aggregate,
            period,
            origin: None,
            bucket: None,
            done: false,
        }
    }

    fn close(&mut self, bucket: (Timestamp, Vec<Value>)) -> Option<Result<Sample, QueryError>> {
        // ---
        let (start, values) = bucket;
        match self.aggregate.apply(&values) {
            Ok(Some(v)) => Some(Ok((start, v))),
            Ok(None) => None,
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl<I> Iterator for PeriodAggregate<I>
where
    I: Iterator<Item = Result<Sample, QueryError>>,
{
    type Item = Result<Sample, QueryError>;

    fn next(&mut self) -> Option<Self::Item> {
        // ---
        while !self.done {
            match self.inner.next() {
                None => {
                    self.done = true;
                    let bucket = self.bucket.take()?;
                    return self.close(bucket);
                }
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e));
                }
                Some(Ok((t, v))) => {
                    let origin = *self.origin.get_or_insert_with(|| utc_midnight(t));
                    let start = period_start(t, origin, self.period);
                    match &mut self.bucket {
                        Some((current, values)) if *current == start => values.push(v),
                        _ => {
                            let previous = self.bucket.replace((start, vec![v]));
                            if let Some(item) = previous.and_then(|b| self.close(b)) {
                                return Some(item);
                            }
                        }
                    }
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::timeseries::{collect_series, from_samples};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn at(h: u32, m: u32, s: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2014, 1, 1, h, m, s).unwrap()
    }

    fn params(value: Json) -> Map<String, Json> {
        value.as_object().cloned().unwrap()
    }

    fn run(filter: &Filter, samples: Vec<Sample>) -> Result<Vec<Sample>, QueryError> {
        collect_series(filter.apply(from_samples(samples)))
    }

    #[test]
    fn test_from_config() {
        // ---
        let f = Filter::from_config("scale", &params(json!({"factor": 2.0}))).unwrap();
        assert_eq!(f, Filter::Scale { factor: 2.0, offset: 0.0 });

        let f = Filter::from_config("repeat_previous", &params(json!({"period_seconds": 60}))).unwrap();
        assert_eq!(
            f,
            Filter::Normalize {
                mode: NormalizeMode::Fill,
                period: Duration::seconds(60),
                drop_extra: true
            }
        );

        assert!(Filter::from_config("sum", &Map::new()).is_err());
        assert!(Filter::from_config("sum", &params(json!({"period_seconds": 0}))).is_err());
        assert!(Filter::from_config("round", &params(json!({"digits": 2}))).is_err());
        assert!(Filter::from_config("smooth", &Map::new()).is_err());
    }

    #[test]
    fn test_round_and_scale() {
        // ---
        let samples = vec![(at(0, 0, 0), Value::Float(1.256)), (at(0, 1, 0), Value::Integer(3))];
        let out = run(&Filter::Round { places: 1 }, samples.clone()).unwrap();
        assert_eq!(out[0].1, Value::Float(1.3));
        assert_eq!(out[1].1, Value::Float(3.0));

        let out = run(&Filter::Scale { factor: 2.0, offset: 1.0 }, samples).unwrap();
        assert_eq!(out[1].1, Value::Float(7.0));

        let err = run(&Filter::Scale { factor: 1.0, offset: 0.0 }, vec![(at(0, 0, 0), Value::from("x"))]);
        assert!(matches!(err, Err(QueryError::NonNumeric { .. })));
    }

    #[test]
    fn test_align_up() {
        // ---
        let p = Duration::minutes(15);
        assert_eq!(align_up(at(9, 7, 0), p), at(9, 15, 0));
        assert_eq!(align_up(at(9, 15, 0), p), at(9, 15, 0));
    }

    #[test]
    fn test_linear_interpolation() {
        // ---
        let filter = Filter::Normalize {
            mode: NormalizeMode::LinearInterpolation,
            period: Duration::minutes(10),
            drop_extra: true,
        };
        let samples = vec![(at(0, 5, 0), Value::Float(0.0)), (at(0, 25, 0), Value::Float(20.0))];
        let out = run(&filter, samples).unwrap();
        assert_eq!(
            out,
            vec![(at(0, 10, 0), Value::Float(5.0)), (at(0, 20, 0), Value::Float(15.0))]
        );
    }

    #[test]
    fn test_interpolation_is_identity_on_aligned_input() {
        // ---
        let filter = Filter::Normalize {
            mode: NormalizeMode::LinearInterpolation,
            period: Duration::minutes(15),
            drop_extra: true,
        };
        let samples: Vec<Sample> = (0..8)
            .map(|i| (at(1, 0, 0) + Duration::minutes(15 * i), Value::Float(i as f64 * 1.5)))
            .collect();
        assert_eq!(run(&filter, samples.clone()).unwrap(), samples);
    }

    #[test]
    fn test_fill_keeps_extra_samples() {
        // ---
        let filter = Filter::Normalize {
            mode: NormalizeMode::Fill,
            period: Duration::minutes(10),
            drop_extra: false,
        };
        let samples = vec![
            (at(0, 0, 0), Value::Integer(1)),
            (at(0, 15, 0), Value::Integer(2)),
            (at(0, 30, 0), Value::Integer(3)),
        ];
        let out = run(&filter, samples).unwrap();
        assert_eq!(
            out,
            vec![
                (at(0, 0, 0), Value::Integer(1)),
                (at(0, 10, 0), Value::Integer(1)),
                (at(0, 15, 0), Value::Integer(2)),
                (at(0, 20, 0), Value::Integer(2)),
                (at(0, 30, 0), Value::Integer(3)),
            ]
        );
    }

    #[test]
    fn test_fill_only_repeats_earlier_values() {
        // ---
        let filter = Filter::Normalize {
            mode: NormalizeMode::Fill,
            period: Duration::seconds(7),
            drop_extra: true,
        };
        let samples: Vec<Sample> = (0..20)
            .map(|i| (at(2, 0, 0) + Duration::seconds(i * 5), Value::Integer(i)))
            .collect();
        for (t, v) in run(&filter, samples.clone()).unwrap() {
            assert!(samples.iter().any(|(st, sv)| *st <= t && *sv == v));
        }
    }

    #[test]
    fn test_sum_and_average_over_period() {
        // ---
        let n = 60i64;
        let samples: Vec<Sample> = (0..n)
            .map(|i| (at(0, 0, 0) + Duration::seconds(i), Value::Integer(i)))
            .collect();
        let period = Duration::seconds(n);

        let sum = Filter::Aggregate {
            aggregate: Aggregate::Sum,
            period,
        };
        assert_eq!(
            run(&sum, samples.clone()).unwrap(),
            vec![(at(0, 0, 0), Value::Integer(n * (n - 1) / 2))]
        );

        let avg = Filter::Aggregate {
            aggregate: Aggregate::Avg,
            period,
        };
        assert_eq!(
            run(&avg, samples).unwrap(),
            vec![(at(0, 0, 0), Value::Float((n - 1) as f64 / 2.0))]
        );
    }

    #[test]
    fn test_aggregate_emits_one_sample_per_period() {
        // ---
        let samples = vec![
            (at(0, 0, 0), Value::Float(1.0)),
            (at(0, 0, 30), Value::Float(2.0)),
            (at(0, 2, 0), Value::Float(5.0)),
        ];
        let sum = Filter::Aggregate {
            aggregate: Aggregate::Sum,
            period: Duration::minutes(1),
        };
        assert_eq!(
            run(&sum, samples).unwrap(),
            vec![(at(0, 0, 0), Value::Float(3.0)), (at(0, 2, 0), Value::Float(5.0))]
        );
    }

    #[test]
    fn test_filters_reject_decreasing_time() {
        // ---
        let samples = vec![(at(1, 0, 0), Value::Float(1.0)), (at(0, 0, 0), Value::Float(2.0))];
        let out: Vec<_> = Filter::Round { places: 0 }.apply(from_samples(samples)).collect();
        assert!(matches!(out[1], Err(QueryError::NonMonotonic { .. })));
    }
}
