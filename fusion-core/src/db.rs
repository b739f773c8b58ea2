use crate::config::DatabaseConfig;
use sqlx::{postgres::PgPoolOptions, PgPool};

pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.url)
        .await
}

pub async fn health_check(pool: &PgPool) -> Result<String, sqlx::Error> {
    let row: (String,) = sqlx::query_as("SELECT version()").fetch_one(pool).await?;
    Ok(row.0)
}

/// Number of traces stored so far, for the `--health` report.
pub async fn trace_count(pool: &PgPool) -> Result<i64, sqlx::Error> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM information_schema.tables WHERE table_name = 'fusion_traces'",
    )
    .fetch_one(pool)
    .await?;
    if row.0 == 0 {
        return Ok(0);
    }
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM fusion_traces")
        .fetch_one(pool)
        .await?;
    Ok(row.0)
}
