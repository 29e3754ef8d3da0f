//! Lazy timestamp join of many series.
//!
//! [`merge`] takes result groups (`{group name: [series]}`) and pulls
//! every series in step. With `drop_partial` a row is emitted only for
//! timestamps every series has; without it every timestamp of any series
//! produces a row and absent slots are `None`.

use indexmap::IndexMap;
use serde::Serialize;

use crate::models::{Timestamp, Value};
use crate::timeseries::{Monotonic, QueryError, Sample, TimeSeries};

/// `{group name: [series]}` as produced by the input facade.
pub type ResultGroup = IndexMap<String, Vec<TimeSeries>>;

/// One merged timestamp. Each group holds one slot per series, in the
/// order the series were given, even for single-series groups.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergedRow {
    pub time: Timestamp,
    pub groups: IndexMap<String, Vec<Option<Value>>>,
}

// ---

pub struct Merger {
    series: Vec<Monotonic<TimeSeries>>,
    /// Group name and number of series, in output order.
    layout: Vec<(String, usize)>,
    heads: Vec<Option<Sample>>,
    /// Heads consumed by the last row, pulled again on the next step.
    refill: Vec<bool>,
    drop_partial: bool,
    done: bool,
}

/// Join `groups` on timestamp. Groups sharing a name are concatenated.
pub fn merge(groups: Vec<ResultGroup>, drop_partial: bool) -> Merger {
    // ---
    let mut by_name: IndexMap<String, Vec<TimeSeries>> = IndexMap::new();
    for group in groups {
        for (name, series) in group {
            by_name.entry(name).or_default().extend(series);
        }
    }

    let mut layout = Vec::with_capacity(by_name.len());
    let mut series = Vec::new();
    for (name, members) in by_name {
        layout.push((name, members.len()));
        series.extend(members.into_iter().map(Monotonic::new));
    }

    Merger {
        heads: vec![None; series.len()],
        refill: vec![true; series.len()],
        series,
        layout,
        drop_partial,
        done: false,
    }
}

impl Merger {
    fn advance(&mut self, i: usize) -> Result<(), QueryError> {
        // ---
        self.heads[i] = self.series[i].next().transpose()?;
        Ok(())
    }

    fn row(&self, time: Timestamp, mut values: Vec<Option<Value>>) -> MergedRow {
        // ---
        let mut groups = IndexMap::with_capacity(self.layout.len());
        let mut rest = values.drain(..);
        for (name, count) in &self.layout {
            groups.insert(name.clone(), rest.by_ref().take(*count).collect());
        }
        MergedRow { time, groups }
    }

    /// Emit a row only when every head sits on the same timestamp.
    fn next_complete(&mut self) -> Result<Option<MergedRow>, QueryError> {
        // ---
        loop {
            if self.heads.iter().any(Option::is_none) {
                return Ok(None);
            }
            let Some(target) = self.heads.iter().flatten().map(|(t, _)| *t).max() else {
                return Ok(None);
            };

            let mut aligned = true;
            for i in 0..self.heads.len() {
                while let Some((t, _)) = &self.heads[i] {
                    if *t >= target {
                        break;
                    }
                    self.advance(i)?;
                }
                match &self.heads[i] {
                    None => return Ok(None),
                    Some((t, _)) if *t > target => aligned = false,
                    Some(_) => {}
                }
            }
            if !aligned {
                continue;
            }

            let values = self
                .heads
                .iter()
                .map(|h| h.as_ref().map(|(_, v)| v.clone()))
                .collect();
            self.refill.fill(true);
            return Ok(Some(self.row(target, values)));
        }
    }

    /// Emit a row for the earliest head; lagging series get `None`.
    fn next_any(&mut self) -> Result<Option<MergedRow>, QueryError> {
        // ---
        let Some(target) = self.heads.iter().flatten().map(|(t, _)| *t).min() else {
            return Ok(None);
        };

        let mut values = Vec::with_capacity(self.heads.len());
        for i in 0..self.heads.len() {
            match &self.heads[i] {
                Some((t, v)) if *t == target => {
                    values.push(Some(v.clone()));
                    self.refill[i] = true;
                }
                _ => values.push(None),
            }
        }
        Ok(Some(self.row(target, values)))
    }

    fn step(&mut self) -> Result<Option<MergedRow>, QueryError> {
        // ---
        for i in 0..self.series.len() {
            if std::mem::take(&mut self.refill[i]) {
                self.advance(i)?;
            }
        }
        if self.series.is_empty() {
            return Ok(None);
        }
        if self.drop_partial {
            self.next_complete()
        } else {
            self.next_any()
        }
    }
}

impl Iterator for Merger {
    type Item = Result<MergedRow, QueryError>;

    fn next(&mut self) -> Option<Self::Item> {
        // ---
        if self.done {
            return None;
        }
        match self.step() {
            Ok(Some(row)) => Some(Ok(row)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::timeseries::from_samples;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    fn at(h: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2014, 1, 1, h, 0, 0).unwrap()
    }

    fn series(points: &[(u32, f64)]) -> TimeSeries {
        from_samples(points.iter().map(|&(h, v)| (at(h), Value::Float(v))).collect())
    }

    fn two_groups() -> Vec<ResultGroup> {
        vec![
            IndexMap::from([("a".to_string(), vec![series(&[(8, 1.0), (9, 2.0), (10, 3.0)])])]),
            IndexMap::from([("b".to_string(), vec![series(&[(8, 10.0), (10, 30.0)])])]),
        ]
    }

    #[test]
    fn test_drop_partial_keeps_intersection() {
        // ---
        let rows: Vec<MergedRow> = merge(two_groups(), true).collect::<Result<_, _>>().unwrap();
        let times: Vec<_> = rows.iter().map(|r| r.time).collect();
        assert_eq!(times, vec![at(8), at(10)]);
        assert_eq!(rows[1].groups["a"], vec![Some(Value::Float(3.0))]);
        assert_eq!(rows[1].groups["b"], vec![Some(Value::Float(30.0))]);
    }

    #[test]
    fn test_no_drop_keeps_union() {
        // ---
        let rows: Vec<MergedRow> = merge(two_groups(), false).collect::<Result<_, _>>().unwrap();
        let times: Vec<_> = rows.iter().map(|r| r.time).collect();
        assert_eq!(times, vec![at(8), at(9), at(10)]);
        assert_eq!(rows[1].groups["a"], vec![Some(Value::Float(2.0))]);
        assert_eq!(rows[1].groups["b"], vec![None]);
    }

    #[test]
    fn test_group_with_several_series() {
        // ---
        let group = IndexMap::from([(
            "load".to_string(),
            vec![series(&[(1, 1.0), (2, 2.0)]), series(&[(2, 20.0), (3, 30.0)])],
        )]);
        let rows: Vec<MergedRow> = merge(vec![group], false).collect::<Result<_, _>>().unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].groups["load"], vec![Some(Value::Float(1.0)), None]);
        assert_eq!(
            rows[1].groups["load"],
            vec![Some(Value::Float(2.0)), Some(Value::Float(20.0))]
        );
        assert_eq!(rows[2].groups["load"], vec![None, Some(Value::Float(30.0))]);
    }

    #[test]
    fn test_drop_partial_stops_when_any_series_ends() {
        // ---
        let group = IndexMap::from([(
            "g".to_string(),
            vec![series(&[(1, 1.0), (5, 5.0)]), series(&[(2, 2.0), (3, 3.0)])],
        )]);
        assert_eq!(merge(vec![group], true).count(), 0);
    }

    #[test]
    fn test_out_of_order_input_is_an_error() {
        // ---
        let group = IndexMap::from([("g".to_string(), vec![series(&[(2, 1.0), (1, 2.0)])])]);
        let results: Vec<_> = merge(vec![group], false).collect();
        assert_eq!(results.len(), 2);
        assert!(matches!(results[1], Err(QueryError::NonMonotonic { .. })));
    }

    #[test]
    fn test_empty_input() {
        // ---
        assert_eq!(merge(Vec::new(), true).count(), 0);
        assert_eq!(merge(Vec::new(), false).count(), 0);
    }
}
