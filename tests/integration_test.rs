//! End-to-end checks through the public API: sensor map, CSV ingest,
//! queries, merging and dynamic output tables.

use std::io::Cursor;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use indexmap::IndexMap;
use pretty_assertions::assert_eq;
use serde_json::json;

use openeis_core::facade::{InputFacade, QueryOptions, QuerySets};
use openeis_core::ingest::{ingest_files, run_ingest, CancelToken, Row};
use openeis_core::merge::merge;
use openeis_core::output::{ColumnType, FieldSpec, OutputTables};
use openeis_core::sniffer::SnifferOptions;
use openeis_core::store::{IngestStatus, OrderBy, SeriesResult};
use openeis_core::{
    Aggregate, AnalysisId, Catalog, DataStore, IngestId, ProjectId, SensorMap, SensorMapId, Timestamp, TruncKind,
    Value,
};

fn at(d: u32, h: u32, m: u32) -> Timestamp {
    Utc.with_ymd_and_hms(2009, 9, d, h, m, 0).unwrap()
}

fn oat_map() -> SensorMap {
    let doc = json!({
        "version": 1,
        "files": {
            "0": {
                "signature": {"headers": ["Date", "OAT"]},
                "timestamp": {"columns": ["Date"], "format": "%m/%d/%Y %H:%M"}
            }
        },
        "sensors": {
            "Site": {"level": "site"},
            "Site/OAT": {"type": "OutdoorAirTemperature", "unit": "fahrenheit", "file": "0", "column": "OAT"}
        }
    });
    SensorMap::from_value(doc, Catalog::builtin()).unwrap()
}

fn pair_map() -> SensorMap {
    let doc = json!({
        "version": 1,
        "files": {
            "a": {
                "signature": {"headers": ["Date", "A"]},
                "timestamp": {"columns": ["Date"], "format": "%m/%d/%Y %H:%M"}
            },
            "b": {
                "signature": {"headers": ["Date", "B"]},
                "timestamp": {"columns": ["Date"], "format": "%m/%d/%Y %H:%M"}
            }
        },
        "sensors": {
            "Site": {"level": "site"},
            "Site/A": {"type": "OutdoorAirTemperature", "unit": "fahrenheit", "file": "a", "column": "A"},
            "Site/B": {"type": "OutdoorAirTemperature", "unit": "fahrenheit", "file": "b", "column": "B"}
        }
    });
    SensorMap::from_value(doc, Catalog::builtin()).unwrap()
}

fn ingest(map: SensorMap, files: &[(&str, &str)]) -> (Arc<DataStore>, SensorMapId, IngestId) {
    let store = DataStore::new();
    let map_id = store
        .create_sensor_map(ProjectId::new(1), "test", map, Catalog::builtin())
        .unwrap();
    let names = files.iter().map(|(k, _)| (k.to_string(), format!("{k}.csv"))).collect();
    let ingest_id = store.create_ingest(map_id, "upload", names).unwrap();
    let streams: IndexMap<String, Cursor<Vec<u8>>> = files
        .iter()
        .map(|(k, text)| (k.to_string(), Cursor::new(text.as_bytes().to_vec())))
        .collect();
    run_ingest(
        &store,
        ingest_id,
        streams,
        Catalog::builtin(),
        &SnifferOptions::default(),
        &CancelToken::new(),
    )
    .unwrap();
    (store, map_id, ingest_id)
}

fn parse_rows(map: &SensorMap, text: &str) -> Vec<Row> {
    let files = IndexMap::from([("0".to_string(), Cursor::new(text.as_bytes().to_vec()))]);
    let mut opened = ingest_files(map, files, Catalog::builtin(), &SnifferOptions::default()).unwrap();
    let file = opened.next().unwrap().unwrap();
    file.rows.collect::<Result<Vec<_>, _>>().unwrap()
}

fn topics(group: &str, paths: &[&str]) -> IndexMap<String, Vec<String>> {
    IndexMap::from([(group.to_string(), paths.iter().map(|p| p.to_string()).collect())])
}

#[test]
fn test_minimal_single_sensor_ingest() {
    // ---
    let (store, map_id, ingest_id) = ingest(oat_map(), &[("0", "09/29/2009 15:00,74.72\n09/29/2009 16:00,75.52\n")]);
    assert_eq!(store.ingest(ingest_id).unwrap().status, IngestStatus::Complete);
    assert_eq!(store.table_counts()["FloatTableData"], 2);

    let facade = InputFacade::new(store, map_id, topics("OAT", &["Site/OAT"]), Vec::new()).unwrap();
    let QuerySets::Series(series) = facade.get_query_sets("OAT", &QueryOptions::default()).unwrap() else {
        panic!("expected plain series");
    };
    let samples: Vec<_> = series
        .into_iter()
        .flat_map(|s| s.collect::<Vec<_>>())
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(
        samples,
        vec![
            (at(29, 15, 0), Value::Float(74.72)),
            (at(29, 16, 0), Value::Float(75.52)),
        ]
    );
}

#[test]
fn test_merge_drop_partial_keeps_common_timestamps() {
    // ---
    let (store, map_id, _) = ingest(
        pair_map(),
        &[
            ("a", "09/29/2009 08:00,1\n09/29/2009 09:00,2\n09/29/2009 10:00,3\n"),
            ("b", "09/29/2009 08:00,10\n09/29/2009 10:00,30\n"),
        ],
    );
    let facade = InputFacade::new(store, map_id, topics("temps", &["Site/A", "Site/B"]), Vec::new()).unwrap();
    let options = QueryOptions {
        wrap_for_merge: true,
        ..QueryOptions::default()
    };
    let QuerySets::ForMerge(group) = facade.get_query_sets("temps", &options).unwrap() else {
        panic!("expected a merge group");
    };

    let rows = merge(vec![group], true).collect::<Result<Vec<_>, _>>().unwrap();
    let times: Vec<_> = rows.iter().map(|r| r.time).collect();
    assert_eq!(times, vec![at(29, 8, 0), at(29, 10, 0)]);
    assert_eq!(rows[0].groups["temps"], vec![Some(Value::Float(1.0)), Some(Value::Float(10.0))]);
    assert_eq!(rows[1].groups["temps"], vec![Some(Value::Float(3.0)), Some(Value::Float(30.0))]);
}

#[test]
fn test_merge_without_drop_fills_gaps() {
    // ---
    let (store, map_id, _) = ingest(
        pair_map(),
        &[
            ("a", "09/29/2009 08:00,1\n09/29/2009 09:00,2\n09/29/2009 10:00,3\n"),
            ("b", "09/29/2009 08:00,10\n09/29/2009 10:00,30\n"),
        ],
    );
    let facade = InputFacade::new(store, map_id, topics("temps", &["Site/A", "Site/B"]), Vec::new()).unwrap();
    let options = QueryOptions {
        wrap_for_merge: true,
        ..QueryOptions::default()
    };
    let QuerySets::ForMerge(group) = facade.get_query_sets("temps", &options).unwrap() else {
        panic!("expected a merge group");
    };

    let rows = merge(vec![group], false).collect::<Result<Vec<_>, _>>().unwrap();
    let times: Vec<_> = rows.iter().map(|r| r.time).collect();
    assert_eq!(times, vec![at(29, 8, 0), at(29, 9, 0), at(29, 10, 0)]);
    assert_eq!(rows[1].groups["temps"], vec![Some(Value::Float(2.0)), None]);
}

#[test]
fn test_group_by_hour_average() {
    // ---
    let (store, map_id, ingest_id) = ingest(
        oat_map(),
        &[("0", "09/29/2009 09:00,10\n09/29/2009 09:30,20\n09/29/2009 10:00,30\n")],
    );
    let sensor = store.sensor_by_path(map_id, "Site/OAT").unwrap();
    let result = store
        .query(sensor.id, Some(&[ingest_id]))
        .unwrap()
        .timeseries(Some(TruncKind::Hour), Aggregate::Avg)
        .unwrap();
    assert_eq!(
        result.into_samples().unwrap(),
        Some(vec![(at(29, 9, 0), Value::Float(15.0)), (at(29, 10, 0), Value::Float(30.0))])
    );

    let all = store
        .query(sensor.id, Some(&[ingest_id]))
        .unwrap()
        .timeseries(Some(TruncKind::All), Aggregate::Max)
        .unwrap();
    assert!(matches!(all, SeriesResult::Scalar(Some(Value::Float(v))) if v == 30.0));
}

#[test]
fn test_out_of_range_value_is_rejected() {
    // ---
    let rows = parse_rows(&oat_map(), "09/29/2009 15:00,9999\n");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].columns[1], None);
    assert_eq!(rows[0].errors.len(), 1);
    assert_eq!(rows[0].errors[0].index, 1);
    assert!(rows[0].errors[0].error.is_out_of_range());
}

#[test]
fn test_dynamic_tables_are_shared_and_scoped() {
    // ---
    let tables = OutputTables::new();
    let fields: FieldSpec = IndexMap::from([
        ("time".to_string(), ColumnType::Timestamp),
        ("value".to_string(), ColumnType::Float),
    ]);
    let project = ProjectId::new(7);
    let a1 = tables.create_output(project, AnalysisId::new(), "out", &fields).unwrap();
    let a2 = tables.create_output(project, AnalysisId::new(), "out", &fields).unwrap();
    assert_eq!(a1.layout.physical, a2.layout.physical);
    assert_eq!(tables.physical_tables().len(), 1);

    let row = vec![Some(Value::Datetime(at(29, 8, 0))), Some(Value::Float(1.5))];
    tables.insert(&a1, vec![row]).unwrap();
    assert_eq!(tables.rows(&a1).len(), 1);
    assert!(tables.rows(&a2).is_empty());
}

#[test]
fn test_map_validation_reports_unresolved_references() {
    // ---
    let valid = json!({
        "version": 1,
        "files": {"0": {"signature": {"headers": ["Date", "OAT"]}, "timestamp": {"columns": [0]}}},
        "sensors": {
            "Site": {"level": "site"},
            "Site/OAT": {"type": "OutdoorAirTemperature", "unit": "fahrenheit", "file": "0", "column": "OAT"}
        }
    });
    assert!(SensorMap::from_value(valid.clone(), Catalog::builtin()).is_ok());

    let mut bad_unit = valid.clone();
    bad_unit["sensors"]["Site/OAT"]["unit"] = json!("kilowatt");
    assert!(SensorMap::from_value(bad_unit, Catalog::builtin()).is_err());

    let mut bad_column = valid.clone();
    bad_column["sensors"]["Site/OAT"]["column"] = json!("RAT");
    assert!(SensorMap::from_value(bad_column, Catalog::builtin()).is_err());

    let mut unused_file = valid;
    unused_file["files"]["1"] = json!({"signature": {"headers": ["Date"]}, "timestamp": {"columns": [0]}});
    assert!(SensorMap::from_value(unused_file, Catalog::builtin()).is_err());
}

#[test]
fn test_row_count_and_line_numbers_follow_source() {
    // ---
    let text = "Date,OAT\n09/29/2009 15:00,70\n09/29/2009 16:00,71\n09/29/2009 17:00,72\n";
    let rows = parse_rows(&oat_map(), text);
    let lines: Vec<u64> = rows.iter().map(|r| r.line_num).collect();
    assert_eq!(lines, vec![2, 3, 4]);
}

#[test]
fn test_query_order_is_stable_on_ties() {
    // ---
    let text = "09/29/2009 16:00,3\n09/29/2009 15:00,1\n09/29/2009 16:00,4\n09/29/2009 15:00,2\n";
    let (store, map_id, ingest_id) = ingest(oat_map(), &[("0", text)]);
    let sensor = store.sensor_by_path(map_id, "Site/OAT").unwrap();
    let samples = store
        .query(sensor.id, Some(&[ingest_id]))
        .unwrap()
        .order_by(OrderBy::Time)
        .into_series()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    let values: Vec<_> = samples.into_iter().map(|(_, v)| v).collect();
    assert_eq!(
        values,
        vec![Value::Float(1.0), Value::Float(2.0), Value::Float(3.0), Value::Float(4.0)]
    );
}

#[test]
fn test_failed_dataset_stays_invisible() {
    // ---
    let (store, map_id, ingest_id) = ingest(oat_map(), &[]);
    assert_eq!(store.ingest(ingest_id).unwrap().status, IngestStatus::Error);

    let facade = InputFacade::new(store, map_id, topics("OAT", &["Site/OAT"]), vec![ingest_id]).unwrap();
    assert!(facade.ingests().is_empty());
    assert_eq!(facade.get_start_end_times().unwrap(), None);
}
