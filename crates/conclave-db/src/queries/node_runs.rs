//! Database query functions for the `pipeline_node_runs` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{NodeRunStatus, PipelineNodeRun};

/// A finished node attempt-series, ready to persist.
#[derive(Debug, Clone)]
pub struct NewNodeRun<'a> {
    pub run_id: Uuid,
    pub node_id: &'a str,
    pub kind: &'a str,
    pub status: NodeRunStatus,
    pub input_summary: Option<&'a serde_json::Value>,
    pub output_summary: Option<&'a serde_json::Value>,
    pub error: Option<&'a str>,
    pub retry_count: i32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

/// Insert a node run row. The executor writes exactly one row per node per
/// run, after the node's terminal outcome.
pub async fn insert_node_run(pool: &PgPool, new: &NewNodeRun<'_>) -> Result<PipelineNodeRun> {
    let row = sqlx::query_as::<_, PipelineNodeRun>(
        "INSERT INTO pipeline_node_runs \
             (run_id, node_id, kind, status, input_summary, output_summary, \
              error, retry_count, started_at, completed_at, duration_ms) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
         RETURNING *",
    )
    .bind(new.run_id)
    .bind(new.node_id)
    .bind(new.kind)
    .bind(new.status)
    .bind(new.input_summary)
    .bind(new.output_summary)
    .bind(new.error)
    .bind(new.retry_count)
    .bind(new.started_at)
    .bind(new.completed_at)
    .bind(new.duration_ms)
    .fetch_one(pool)
    .await
    .context("failed to insert node run")?;

    Ok(row)
}

/// List all node runs for a pipeline run, in insertion order.
pub async fn list_node_runs(pool: &PgPool, run_id: Uuid) -> Result<Vec<PipelineNodeRun>> {
    let rows = sqlx::query_as::<_, PipelineNodeRun>(
        "SELECT * FROM pipeline_node_runs WHERE run_id = $1 ORDER BY id ASC",
    )
    .bind(run_id)
    .fetch_all(pool)
    .await
    .context("failed to list node runs")?;

    Ok(rows)
}

/// Fetch the node run for a specific `(run_id, node_id)` pair.
pub async fn get_node_run(
    pool: &PgPool,
    run_id: Uuid,
    node_id: &str,
) -> Result<Option<PipelineNodeRun>> {
    let row = sqlx::query_as::<_, PipelineNodeRun>(
        "SELECT * FROM pipeline_node_runs WHERE run_id = $1 AND node_id = $2",
    )
    .bind(run_id)
    .bind(node_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch node run")?;

    Ok(row)
}
