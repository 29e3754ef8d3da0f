//! PostgreSQL persistence for datasets and analysis outputs.
//!
//! The in-process [`DataStore`] stays the query engine; these functions
//! copy finished work into the database. Row inserts are batched with
//! `QueryBuilder::push_values` inside one transaction per call.

use std::collections::HashMap;
use std::sync::LazyLock;

use anyhow::{anyhow, Result};
use sqlx::query_builder::Separated;
use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::analysis::Analysis;
use crate::models::{IngestId, SensorId, StorageType, Value};
use crate::output::{ColumnType, LogRecord, OutputError, OutputTables, TableLayout};
use crate::schema::data_table;
use crate::store::{DataStore, IngestStatus};

/// Postgres limits a statement to 65535 bind parameters.
const ROWS_PER_INSERT: usize = 1000;

/// Serializes dynamic table creation within this process.
static CREATE_LOCK: LazyLock<tokio::sync::Mutex<()>> = LazyLock::new(|| tokio::sync::Mutex::new(()));

// ---

/// Database ids assigned when a dataset was persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredIngest {
    pub map_id: i64,
    pub sensors: HashMap<SensorId, i64>,
    pub rows: u64,
}

fn push_value<Sep: std::fmt::Display>(b: &mut Separated<'_, '_, Postgres, Sep>, storage_type: StorageType, value: Option<&Value>) {
    // ---
    match (storage_type, value) {
        (_, Some(Value::Boolean(v))) => b.push_bind(*v),
        (_, Some(Value::Integer(v))) => b.push_bind(*v),
        (_, Some(Value::Float(v))) => b.push_bind(*v),
        (_, Some(Value::String(v))) => b.push_bind(v.clone()),
        (_, Some(Value::Datetime(v))) => b.push_bind(*v),
        (StorageType::Boolean, None) => b.push_bind(None::<bool>),
        (StorageType::Integer, None) => b.push_bind(None::<i64>),
        (StorageType::Float, None) => b.push_bind(None::<f64>),
        (StorageType::String, None) => b.push_bind(None::<String>),
        (StorageType::Datetime, None) => b.push_bind(None::<chrono::DateTime<chrono::Utc>>),
    };
}

/// Persist a complete dataset: its sensor map, sensors, ingest record and
/// rows. Fresh database ids are assigned to the map and its sensors.
pub async fn store_ingest(pool: &PgPool, store: &DataStore, ingest_id: IngestId) -> Result<StoredIngest> {
    // ---
    let ingest = store.ingest(ingest_id)?;
    if ingest.status != IngestStatus::Complete {
        return Err(anyhow!("ingest {ingest_id} is {}, only complete datasets are stored", ingest.status));
    }
    let map = store.sensor_map(ingest.map_id)?;

    let mut tx = pool.begin().await?;

    let (map_id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO sensor_map (project_id, name, map, created)
        VALUES ($1, $2, $3::jsonb, $4)
        RETURNING id
        "#,
    )
    .bind(map.project.get())
    .bind(&map.name)
    .bind(serde_json::to_string(&map.map)?)
    .bind(map.created)
    .fetch_one(&mut *tx)
    .await?;

    let mut sensors = HashMap::new();
    let records = store.sensors(ingest.map_id);
    for sensor in &records {
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO sensor (map_id, path, sensor_type, unit, storage_type, timezone)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(map_id)
        .bind(&sensor.path)
        .bind(&sensor.sensor_type)
        .bind(&sensor.unit)
        .bind(sensor.storage_type.as_str())
        .bind(sensor.timezone.name())
        .fetch_one(&mut *tx)
        .await?;
        sensors.insert(sensor.id, id);
    }

    sqlx::query(
        r#"
        INSERT INTO sensor_ingest (id, map_id, name, files, status, created, ended, log)
        VALUES ($1, $2, $3, $4::jsonb, $5, $6, $7, $8::jsonb)
        "#,
    )
    .bind(ingest.id.get())
    .bind(map_id)
    .bind(&ingest.name)
    .bind(serde_json::to_string(&ingest.files)?)
    .bind(ingest.status.to_string())
    .bind(ingest.created)
    .bind(ingest.ended)
    .bind(serde_json::to_string(&ingest.log)?)
    .execute(&mut *tx)
    .await?;

    let mut rows = 0u64;
    for sensor in &records {
        let db_sensor = sensors[&sensor.id];
        let samples = store.column(sensor.id, Some(&[ingest_id]))?;
        for chunk in samples.chunks(ROWS_PER_INSERT) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {} (sensor_id, ingest_id, time, value) ",
                data_table(sensor.storage_type)
            ));
            qb.push_values(chunk, |mut b, (time, value)| {
                b.push_bind(db_sensor).push_bind(ingest_id.get()).push_bind(*time);
                push_value(&mut b, sensor.storage_type, Some(value));
            });
            rows += qb.build().execute(&mut *tx).await?.rows_affected();
        }
    }

    tx.commit().await?;
    tracing::info!(ingest = %ingest_id, sensor_map = map_id, rows, "stored ingest");
    Ok(StoredIngest { map_id, sensors, rows })
}

fn is_race(e: &sqlx::Error) -> bool {
    // duplicate_table, or the pg_type unique index hit by a concurrent CREATE
    match e {
        sqlx::Error::Database(db) => matches!(db.code().as_deref(), Some("42P07") | Some("23505")),
        _ => false,
    }
}

async fn create_dynamic_table(pool: &PgPool, layout: &TableLayout) -> Result<(), OutputError> {
    // ---
    let mut ddl = format!(
        "CREATE TABLE IF NOT EXISTS {} (id BIGSERIAL PRIMARY KEY, \
         output_id BIGINT NOT NULL REFERENCES analysis_output (id) ON DELETE CASCADE",
        layout.physical
    );
    for (physical, ty) in layout.columns.values() {
        ddl.push_str(&format!(", {physical} {}", ty.sql_type()));
        if !ty.nullable() {
            ddl.push_str(" NOT NULL");
        }
    }
    ddl.push(')');

    match sqlx::query(&ddl).execute(pool).await {
        Ok(_) => {}
        Err(e) if is_race(&e) => return Err(OutputError::TableRace(layout.physical.clone())),
        Err(e) => return Err(e.into()),
    }
    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS idx_{0}_output ON {0} (output_id)",
        layout.physical
    ))
    .execute(pool)
    .await?;
    Ok(())
}

/// Create the physical table for `layout` unless it exists. Creation is
/// serialized within the process; losing a race against another process
/// reuses the winner's table.
pub async fn ensure_dynamic_table(pool: &PgPool, layout: &TableLayout) -> Result<(), OutputError> {
    // ---
    let _guard = CREATE_LOCK.lock().await;
    match create_dynamic_table(pool, layout).await {
        Err(OutputError::TableRace(table)) => {
            tracing::debug!(%table, "output table created concurrently, reusing it");
            Ok(())
        }
        other => other,
    }
}

/// Persist an analysis record with its outputs, their rows and the
/// messages the application logged. `map_id` is the database id of the
/// sensor map it ran against.
pub async fn store_analysis(
    pool: &PgPool,
    analysis: &Analysis,
    map_id: Option<i64>,
    tables: &OutputTables,
    logs: &[LogRecord],
) -> Result<u64> {
    // ---
    let handles = tables.outputs(analysis.id);
    for handle in &handles {
        ensure_dynamic_table(pool, &handle.layout).await?;
    }

    let mut tx = pool.begin().await?;
    sqlx::query(
        r#"
        INSERT INTO analysis (
            id, project_id, name, application, map_id, config, status,
            progress, message, reports, created, started, ended
        ) VALUES ($1, $2, $3, $4, $5, $6::jsonb, $7, $8, $9, $10::jsonb, $11, $12, $13)
        ON CONFLICT (id) DO UPDATE SET
            status = EXCLUDED.status,
            progress = EXCLUDED.progress,
            message = EXCLUDED.message,
            reports = EXCLUDED.reports,
            started = EXCLUDED.started,
            ended = EXCLUDED.ended
        "#,
    )
    .bind(analysis.id.get())
    .bind(analysis.project.get())
    .bind(&analysis.name)
    .bind(&analysis.application)
    .bind(map_id)
    .bind(serde_json::to_string(&analysis.config)?)
    .bind(analysis.status.to_string())
    .bind(analysis.progress)
    .bind(&analysis.message)
    .bind(serde_json::to_string(&analysis.reports)?)
    .bind(analysis.created)
    .bind(analysis.started)
    .bind(analysis.ended)
    .execute(&mut *tx)
    .await?;

    let mut rows = 0u64;
    for handle in &handles {
        let columns: HashMap<&str, (&str, ColumnType)> = handle
            .layout
            .columns
            .iter()
            .map(|(logical, (physical, ty))| (logical.as_str(), (physical.as_str(), *ty)))
            .collect();
        let (output_id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO analysis_output (analysis_id, name, physical_table, columns)
            VALUES ($1, $2, $3, $4::jsonb)
            RETURNING id
            "#,
        )
        .bind(analysis.id.get())
        .bind(&handle.name)
        .bind(&handle.layout.physical)
        .bind(serde_json::to_string(&columns)?)
        .fetch_one(&mut *tx)
        .await?;

        let owned: Vec<Vec<Option<Value>>> = tables
            .physical_rows(&handle.layout.physical)
            .into_iter()
            .filter(|(owner, _)| *owner == handle.id)
            .map(|(_, values)| values)
            .collect();
        let types = handle.layout.column_types();
        let names: Vec<&str> = handle.layout.columns.values().map(|(p, _)| p.as_str()).collect();

        for chunk in owned.chunks(ROWS_PER_INSERT) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {} (output_id, {}) ",
                handle.layout.physical,
                names.join(", ")
            ));
            qb.push_values(chunk, |mut b, values| {
                b.push_bind(output_id);
                for (ty, value) in types.iter().zip(values) {
                    push_value(&mut b, ty.storage_type(), value.as_ref());
                }
            });
            rows += qb.build().execute(&mut *tx).await?.rows_affected();
        }
    }

    // A re-stored analysis replaces its earlier log
    sqlx::query("DELETE FROM analysis_log WHERE analysis_id = $1")
        .bind(analysis.id.get())
        .execute(&mut *tx)
        .await?;
    for chunk in logs.chunks(ROWS_PER_INSERT) {
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new("INSERT INTO analysis_log (analysis_id, level, message, timestamp) ");
        qb.push_values(chunk, |mut b, record| {
            b.push_bind(analysis.id.get())
                .push_bind(record.level.to_string())
                .push_bind(record.message.clone())
                .push_bind(record.timestamp);
        });
        qb.build().execute(&mut *tx).await?;
    }

    tx.commit().await?;
    tracing::info!(analysis = %analysis.id, outputs = handles.len(), rows, logs = logs.len(), "stored analysis");
    Ok(rows)
}
