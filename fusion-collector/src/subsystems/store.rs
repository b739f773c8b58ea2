//! PostgreSQL trace sink
//!
//! One row per trace in `fusion_traces`, unique on `trace_id`. Invocations and
//! the error are kept as JSONB so the stored row can be reopened and merged
//! when a triggered run re-ingests the same window.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};

use fusion_core::sink::merge_records;
use fusion_core::{
    FusionError, InvocationRecord, PersistReport, PersistenceError, TraceError, TraceRecord, TraceSink,
    WriteMode,
};

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS fusion_traces (
    id BIGSERIAL PRIMARY KEY,
    trace_id TEXT NOT NULL,
    starttime TIMESTAMPTZ,
    endtime TIMESTAMPTZ,
    runtime BIGINT,
    invocation_information JSONB NOT NULL DEFAULT '{}'::jsonb,
    error JSONB,
    total_memory_used DOUBLE PRECISION NOT NULL DEFAULT 0,
    total_memory_allocated DOUBLE PRECISION NOT NULL DEFAULT 0,
    total_billed_duration DOUBLE PRECISION NOT NULL DEFAULT 0,
    total_duration DOUBLE PRECISION NOT NULL DEFAULT 0,
    total_cold_start_time DOUBLE PRECISION NOT NULL DEFAULT 0,
    lambdas_count INTEGER NOT NULL DEFAULT 0,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
)
"#;

const CREATE_INDEX: &str =
    "CREATE UNIQUE INDEX IF NOT EXISTS fusion_traces_trace_id_idx ON fusion_traces (trace_id)";

const INSERT_COLUMNS: &str = r#"
INSERT INTO fusion_traces (
    trace_id, starttime, endtime, runtime, invocation_information, error,
    total_memory_used, total_memory_allocated, total_billed_duration,
    total_duration, total_cold_start_time, lambdas_count
) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
"#;

#[derive(sqlx::FromRow)]
struct TraceRow {
    trace_id: String,
    starttime: Option<DateTime<Utc>>,
    endtime: Option<DateTime<Utc>>,
    runtime: Option<i64>,
    invocation_information: Json<HashMap<String, InvocationRecord>>,
    error: Option<Json<TraceError>>,
    total_memory_used: f64,
    total_memory_allocated: f64,
    total_billed_duration: f64,
    total_duration: f64,
    total_cold_start_time: f64,
    lambdas_count: i32,
}

impl From<TraceRow> for TraceRecord {
    fn from(row: TraceRow) -> Self {
        TraceRecord {
            trace_id: row.trace_id,
            start_time: row.starttime,
            end_time: row.endtime,
            runtime: row.runtime,
            invocation_information: row.invocation_information.0,
            error: row.error.map(|e| e.0),
            total_memory_used: row.total_memory_used,
            total_memory_allocated: row.total_memory_allocated,
            total_billed_duration: row.total_billed_duration,
            total_duration: row.total_duration,
            total_cold_start_time: row.total_cold_start_time,
            lambdas_count: row.lambdas_count.max(0) as usize,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgTraceSink {
    pool: PgPool,
}

impl PgTraceSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn fetch(&self, trace_id: &str) -> Result<Option<TraceRecord>, sqlx::Error> {
        let row: Option<TraceRow> = sqlx::query_as(
            r#"
            SELECT trace_id, starttime, endtime, runtime, invocation_information, error,
                   total_memory_used, total_memory_allocated, total_billed_duration,
                   total_duration, total_cold_start_time, lambdas_count
            FROM fusion_traces
            WHERE trace_id = $1
            "#,
        )
        .bind(trace_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(TraceRecord::from))
    }

    async fn insert_new(&self, record: &TraceRecord) -> Result<(), PersistenceError> {
        let sql = format!("{INSERT_COLUMNS} ON CONFLICT (trace_id) DO NOTHING");
        let result = bind_record(sqlx::query(&sql), record)
            .execute(&self.pool)
            .await
            .map_err(|e| rejected(record, e))?;

        if result.rows_affected() == 0 {
            return Err(PersistenceError::Duplicate {
                trace_id: record.trace_id.clone(),
            });
        }
        Ok(())
    }

    /// Read-merge-write under a per-trace advisory lock.
    async fn upsert_merged(&self, record: &TraceRecord) -> Result<(), PersistenceError> {
        let mut tx = self.pool.begin().await.map_err(|e| rejected(record, e))?;

        // Serializes writers of one trace_id even before its row exists.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&record.trace_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| rejected(record, e))?;

        let merged = match lock_existing(&mut tx, &record.trace_id)
            .await
            .map_err(|e| rejected(record, e))?
        {
            Some(stored) => merge_records(stored, record.clone()),
            None => record.clone(),
        };

        let sql = format!(
            "{INSERT_COLUMNS} ON CONFLICT (trace_id) DO UPDATE SET
                starttime = EXCLUDED.starttime,
                endtime = EXCLUDED.endtime,
                runtime = EXCLUDED.runtime,
                invocation_information = EXCLUDED.invocation_information,
                error = EXCLUDED.error,
                total_memory_used = EXCLUDED.total_memory_used,
                total_memory_allocated = EXCLUDED.total_memory_allocated,
                total_billed_duration = EXCLUDED.total_billed_duration,
                total_duration = EXCLUDED.total_duration,
                total_cold_start_time = EXCLUDED.total_cold_start_time,
                lambdas_count = EXCLUDED.lambdas_count,
                updated_at = now()"
        );
        bind_record(sqlx::query(&sql), &merged)
            .execute(&mut *tx)
            .await
            .map_err(|e| rejected(record, e))?;

        tx.commit().await.map_err(|e| rejected(record, e))
    }
}

async fn lock_existing(
    tx: &mut Transaction<'_, Postgres>,
    trace_id: &str,
) -> Result<Option<TraceRecord>, sqlx::Error> {
    let row: Option<TraceRow> = sqlx::query_as(
        r#"
        SELECT trace_id, starttime, endtime, runtime, invocation_information, error,
               total_memory_used, total_memory_allocated, total_billed_duration,
               total_duration, total_cold_start_time, lambdas_count
        FROM fusion_traces
        WHERE trace_id = $1
        FOR UPDATE
        "#,
    )
    .bind(trace_id)
    .fetch_optional(&mut **tx)
    .await?;

    Ok(row.map(TraceRecord::from))
}

fn bind_record<'q>(
    query: sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>,
    record: &'q TraceRecord,
) -> sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments> {
    query
        .bind(&record.trace_id)
        .bind(record.start_time)
        .bind(record.end_time)
        .bind(record.runtime)
        .bind(Json(&record.invocation_information))
        .bind(record.error.as_ref().map(Json))
        .bind(record.total_memory_used)
        .bind(record.total_memory_allocated)
        .bind(record.total_billed_duration)
        .bind(record.total_duration)
        .bind(record.total_cold_start_time)
        .bind(record.lambdas_count as i32)
}

fn rejected(record: &TraceRecord, err: sqlx::Error) -> PersistenceError {
    PersistenceError::Rejected {
        trace_id: record.trace_id.clone(),
        message: err.to_string(),
    }
}

#[async_trait]
impl TraceSink for PgTraceSink {
    async fn ensure_schema(&self) -> Result<(), FusionError> {
        sqlx::query(CREATE_TABLE).execute(&self.pool).await?;
        sqlx::query(CREATE_INDEX).execute(&self.pool).await?;
        Ok(())
    }

    async fn persist(&self, records: &[TraceRecord], mode: WriteMode) -> Result<PersistReport, FusionError> {
        let mut report = PersistReport::default();

        for record in records {
            let outcome = match mode {
                WriteMode::InsertSkipDuplicates => self.insert_new(record).await,
                WriteMode::UpsertMerge => self.upsert_merged(record).await,
            };
            if let Err(PersistenceError::Rejected { trace_id, message }) = &outcome {
                tracing::warn!(trace_id = %trace_id, error = %message, "Trace write rejected");
            }
            report.record(outcome);
        }

        Ok(report)
    }

    fn name(&self) -> &str {
        "postgres"
    }
}

// ============================================================================
// TESTS
// ============================================================================
