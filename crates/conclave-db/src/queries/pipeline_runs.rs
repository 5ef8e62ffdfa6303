//! Database query functions for the `pipeline_runs` table.
//!
//! Terminal statuses are write-once: the finishing queries carry a
//! `status IN ('pending', 'running')` guard so a run that already reached a
//! terminal state is never overwritten (the caller sees 0 rows affected).

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{PipelineRun, RunStatus};

/// Insert a new run for a pipeline. Returns the inserted row.
pub async fn insert_run(
    pool: &PgPool,
    pipeline_id: Uuid,
    status: RunStatus,
    trigger_data: &serde_json::Value,
) -> Result<PipelineRun> {
    let run = sqlx::query_as::<_, PipelineRun>(
        "INSERT INTO pipeline_runs (pipeline_id, status, trigger_data) \
         VALUES ($1, $2, $3) \
         RETURNING *",
    )
    .bind(pipeline_id)
    .bind(status)
    .bind(trigger_data)
    .fetch_one(pool)
    .await
    .context("failed to insert pipeline run")?;

    Ok(run)
}

/// Fetch a single run by ID.
pub async fn get_run(pool: &PgPool, id: Uuid) -> Result<Option<PipelineRun>> {
    let run = sqlx::query_as::<_, PipelineRun>("SELECT * FROM pipeline_runs WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch pipeline run")?;

    Ok(run)
}

/// List runs, newest first, capped at `limit`.
pub async fn list_runs(pool: &PgPool, limit: i64) -> Result<Vec<PipelineRun>> {
    let runs = sqlx::query_as::<_, PipelineRun>(
        "SELECT * FROM pipeline_runs ORDER BY started_at DESC LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list pipeline runs")?;

    Ok(runs)
}

/// Mark the node the executor is currently walking.
pub async fn set_current_node(pool: &PgPool, id: Uuid, node_id: &str) -> Result<()> {
    sqlx::query("UPDATE pipeline_runs SET current_node = $1 WHERE id = $2")
        .bind(node_id)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to set current node")?;

    Ok(())
}

/// Transition a non-terminal run to `running`.
pub async fn mark_running(pool: &PgPool, id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE pipeline_runs SET status = 'running' \
         WHERE id = $1 AND status = 'pending'",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to mark run running")?;

    Ok(result.rows_affected())
}

/// Write a terminal status for a run.
///
/// The write-once guard means only the first terminal writer wins; later
/// attempts (e.g. a forced-cancel racing a normal completion) see 0 rows
/// affected. `duration_ms` is computed from `started_at` server-side.
pub async fn finish_run(
    pool: &PgPool,
    id: Uuid,
    status: RunStatus,
    error: Option<&str>,
) -> Result<u64> {
    debug_assert!(status.is_terminal());

    let now = Utc::now();
    let result = sqlx::query(
        "UPDATE pipeline_runs \
         SET status = $1, \
             error = $2, \
             completed_at = $3, \
             duration_ms = (EXTRACT(EPOCH FROM ($3 - started_at)) * 1000)::bigint \
         WHERE id = $4 AND status IN ('pending', 'running')",
    )
    .bind(status)
    .bind(error)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to finish pipeline run")?;

    Ok(result.rows_affected())
}
