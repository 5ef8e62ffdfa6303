//! Database query functions for the `scheduled_action_runs` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};

use crate::models::{ActionRunStatus, ScheduledActionRun, TriggeredBy};

/// Insert a dispatch-attempt row on the claiming transaction.
///
/// The row becomes visible to other instances only when the transaction
/// commits; until then the advisory lock keeps them out of the window.
pub async fn insert_action_run(
    tx: &mut Transaction<'_, Postgres>,
    action_id: i32,
    triggered_at: DateTime<Utc>,
    triggered_by: TriggeredBy,
) -> Result<i64> {
    let (id,): (i64,) = sqlx::query_as(
        "INSERT INTO scheduled_action_runs \
             (action_id, triggered_at, triggered_by, status, started_at) \
         VALUES ($1, $2, $3, 'running', $2) \
         RETURNING id",
    )
    .bind(action_id)
    .bind(triggered_at)
    .bind(triggered_by)
    .fetch_one(&mut **tx)
    .await
    .context("failed to insert scheduled action run")?;

    Ok(id)
}

/// Write the terminal outcome of a dispatch attempt on the claiming
/// transaction.
pub async fn finish_action_run(
    tx: &mut Transaction<'_, Postgres>,
    id: i64,
    status: ActionRunStatus,
    error: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "UPDATE scheduled_action_runs \
         SET status = $1, error = $2, completed_at = NOW() \
         WHERE id = $3",
    )
    .bind(status)
    .bind(error)
    .bind(id)
    .execute(&mut **tx)
    .await
    .context("failed to finish scheduled action run")?;

    Ok(())
}

/// Check whether a dispatch already claimed the window starting at
/// `window_start`.
///
/// The recovery path calls this with `next_run_at - 60s` so that clock skew
/// between instances cannot hide a claim that straddles the boundary. A run
/// counts as a claim while it is still `pending`/`running` as well as after
/// it `completed` -- only failed claims free the window.
pub async fn run_exists_in_window(
    pool: &PgPool,
    action_id: i32,
    window_start: DateTime<Utc>,
) -> Result<bool> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS( \
             SELECT 1 FROM scheduled_action_runs \
             WHERE action_id = $1 \
               AND triggered_at >= $2 \
               AND status IN ('completed', 'running', 'pending') \
         )",
    )
    .bind(action_id)
    .bind(window_start)
    .fetch_one(pool)
    .await
    .context("failed to query action run window")?;

    Ok(exists)
}

/// List all dispatch attempts for an action, newest first.
pub async fn list_action_runs(pool: &PgPool, action_id: i32) -> Result<Vec<ScheduledActionRun>> {
    let runs = sqlx::query_as::<_, ScheduledActionRun>(
        "SELECT * FROM scheduled_action_runs \
         WHERE action_id = $1 ORDER BY triggered_at DESC",
    )
    .bind(action_id)
    .fetch_all(pool)
    .await
    .context("failed to list scheduled action runs")?;

    Ok(runs)
}

/// Insert a dispatch-attempt row outside any claiming transaction.
///
/// Used by tests and the manual-trigger path, where no advisory lock is in
/// play.
pub async fn insert_action_run_direct(
    pool: &PgPool,
    action_id: i32,
    triggered_at: DateTime<Utc>,
    triggered_by: TriggeredBy,
    status: ActionRunStatus,
) -> Result<i64> {
    let (id,): (i64,) = sqlx::query_as(
        "INSERT INTO scheduled_action_runs \
             (action_id, triggered_at, triggered_by, status, started_at) \
         VALUES ($1, $2, $3, $4, $2) \
         RETURNING id",
    )
    .bind(action_id)
    .bind(triggered_at)
    .bind(triggered_by)
    .bind(status)
    .fetch_one(pool)
    .await
    .context("failed to insert scheduled action run")?;

    Ok(id)
}
