//! Database query functions for the `pipelines` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::Pipeline;

/// Insert a new pipeline definition. Returns the inserted row with
/// server-generated defaults (id, created_at).
pub async fn insert_pipeline(
    pool: &PgPool,
    name: &str,
    definition: &serde_json::Value,
    timeout_s: i64,
    max_retries_per_node: i32,
    retry_backoff_base_ms: i64,
    retry_backoff_max_ms: i64,
) -> Result<Pipeline> {
    let pipeline = sqlx::query_as::<_, Pipeline>(
        "INSERT INTO pipelines \
             (name, definition, timeout_s, max_retries_per_node, \
              retry_backoff_base_ms, retry_backoff_max_ms) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         RETURNING *",
    )
    .bind(name)
    .bind(definition)
    .bind(timeout_s)
    .bind(max_retries_per_node)
    .bind(retry_backoff_base_ms)
    .bind(retry_backoff_max_ms)
    .fetch_one(pool)
    .await
    .context("failed to insert pipeline")?;

    Ok(pipeline)
}

/// Fetch a single pipeline by ID.
pub async fn get_pipeline(pool: &PgPool, id: Uuid) -> Result<Option<Pipeline>> {
    let pipeline = sqlx::query_as::<_, Pipeline>("SELECT * FROM pipelines WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch pipeline")?;

    Ok(pipeline)
}

/// List all pipelines, newest first.
pub async fn list_pipelines(pool: &PgPool) -> Result<Vec<Pipeline>> {
    let pipelines =
        sqlx::query_as::<_, Pipeline>("SELECT * FROM pipelines ORDER BY created_at DESC")
            .fetch_all(pool)
            .await
            .context("failed to list pipelines")?;

    Ok(pipelines)
}

/// Delete a pipeline and (via cascade) its runs.
pub async fn delete_pipeline(pool: &PgPool, id: Uuid) -> Result<bool> {
    let result = sqlx::query("DELETE FROM pipelines WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to delete pipeline")?;

    Ok(result.rows_affected() > 0)
}
