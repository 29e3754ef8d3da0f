//! Database schema management for `openeis`.
//!
//! Ensures the sensor, dataset, data and analysis tables exist before
//! anything is persisted. Dynamic output tables are created on demand by
//! [`crate::db`].

use anyhow::Result;
use sqlx::PgPool;

use crate::models::StorageType;

// ---

/// Create or update the database schema (idempotent).
///
/// Safe to call on every startup; no-op if objects already exist. Errors
/// are propagated if any SQL execution fails.
pub async fn create_schema(pool: &PgPool) -> Result<()> {
    // ---
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sensor_map (
            id          BIGSERIAL   PRIMARY KEY,
            project_id  BIGINT      NOT NULL,
            name        TEXT        NOT NULL,
            map         JSONB       NOT NULL,
            created     TIMESTAMPTZ NOT NULL
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Removing a sensor map removes its sensors
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sensor (
            id            BIGSERIAL PRIMARY KEY,
            map_id        BIGINT    NOT NULL REFERENCES sensor_map (id) ON DELETE CASCADE,
            path          TEXT      NOT NULL,
            sensor_type   TEXT      NOT NULL,
            unit          TEXT,
            storage_type  TEXT      NOT NULL,
            timezone      TEXT      NOT NULL,
            UNIQUE (map_id, path)
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sensor_ingest (
            id       UUID        PRIMARY KEY,
            map_id   BIGINT      NOT NULL REFERENCES sensor_map (id) ON DELETE CASCADE,
            name     TEXT        NOT NULL,
            files    JSONB       NOT NULL,
            status   TEXT        NOT NULL,
            created  TIMESTAMPTZ NOT NULL,
            ended    TIMESTAMPTZ,
            log      JSONB       NOT NULL
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // One data table per storage type; rows belong to their dataset
    for storage_type in StorageType::ALL {
        let table = data_table(storage_type);
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id         BIGSERIAL   PRIMARY KEY,
                sensor_id  BIGINT      NOT NULL REFERENCES sensor (id) ON DELETE CASCADE,
                ingest_id  UUID        NOT NULL REFERENCES sensor_ingest (id) ON DELETE CASCADE,
                time       TIMESTAMPTZ NOT NULL,
                value      {value_type}
            );
            "#,
            value_type = sql_type(storage_type),
        ))
        .execute(&mut *tx)
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_sensor_ingest_time ON {table} (sensor_id, ingest_id, time);"
        ))
        .execute(&mut *tx)
        .await?;
    }

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS analysis (
            id           UUID             PRIMARY KEY,
            project_id   BIGINT           NOT NULL,
            name         TEXT             NOT NULL,
            application  TEXT             NOT NULL,
            map_id       BIGINT           REFERENCES sensor_map (id) ON DELETE SET NULL,
            config       JSONB            NOT NULL,
            status       TEXT             NOT NULL,
            progress     DOUBLE PRECISION NOT NULL,
            message      TEXT,
            reports      JSONB            NOT NULL,
            created      TIMESTAMPTZ      NOT NULL,
            started      TIMESTAMPTZ,
            ended        TIMESTAMPTZ
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Logical output tables; their rows live in shared dynamic tables
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS analysis_output (
            id              BIGSERIAL PRIMARY KEY,
            analysis_id     UUID      NOT NULL REFERENCES analysis (id) ON DELETE CASCADE,
            name            TEXT      NOT NULL,
            physical_table  TEXT      NOT NULL,
            columns         JSONB     NOT NULL,
            UNIQUE (analysis_id, name)
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Messages an application logged while it ran
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS analysis_log (
            id           BIGSERIAL   PRIMARY KEY,
            analysis_id  UUID        NOT NULL REFERENCES analysis (id) ON DELETE CASCADE,
            level        TEXT        NOT NULL,
            message      TEXT        NOT NULL,
            timestamp    TIMESTAMPTZ
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

/// Physical data table holding sensors of `storage_type`.
pub fn data_table(storage_type: StorageType) -> &'static str {
    match storage_type {
        StorageType::Boolean => "boolean_table_data",
        StorageType::Datetime => "time_table_data",
        StorageType::Float => "float_table_data",
        StorageType::Integer => "int_table_data",
        StorageType::String => "string_table_data",
    }
}

/// PostgreSQL column type of a sensor value.
pub fn sql_type(storage_type: StorageType) -> &'static str {
    match storage_type {
        StorageType::Boolean => "BOOLEAN",
        StorageType::Datetime => "TIMESTAMPTZ",
        StorageType::Float => "DOUBLE PRECISION",
        StorageType::Integer => "BIGINT",
        StorageType::String => "TEXT",
    }
}
