//! Database query functions for the `scheduled_actions` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};

use crate::models::{ActionKind, ActionStatus, ScheduleKind, ScheduledAction};

/// Fields for a new scheduled action.
///
/// Exactly one of `cron_expression` / `interval_s` / `run_at` / `event_name`
/// should be set, matching `schedule_kind`; the scheduler ignores the rest.
#[derive(Debug, Clone)]
pub struct NewScheduledAction<'a> {
    pub agent_id: &'a str,
    pub kind: ActionKind,
    pub config: &'a serde_json::Value,
    pub schedule_kind: ScheduleKind,
    pub cron_expression: Option<&'a str>,
    pub interval_s: Option<i64>,
    pub run_at: Option<DateTime<Utc>>,
    pub event_name: Option<&'a str>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub timeout_s: i64,
    pub max_retries: i32,
    pub retry_delay_s: i64,
    pub allow_concurrent: bool,
}

/// Insert a scheduled action. Returns the inserted row.
pub async fn insert_action(
    pool: &PgPool,
    new: &NewScheduledAction<'_>,
) -> Result<ScheduledAction> {
    let action = sqlx::query_as::<_, ScheduledAction>(
        "INSERT INTO scheduled_actions \
             (agent_id, kind, config, schedule_kind, cron_expression, interval_s, \
              run_at, event_name, next_run_at, timeout_s, max_retries, \
              retry_delay_s, allow_concurrent) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
         RETURNING *",
    )
    .bind(new.agent_id)
    .bind(new.kind)
    .bind(new.config)
    .bind(new.schedule_kind)
    .bind(new.cron_expression)
    .bind(new.interval_s)
    .bind(new.run_at)
    .bind(new.event_name)
    .bind(new.next_run_at)
    .bind(new.timeout_s)
    .bind(new.max_retries)
    .bind(new.retry_delay_s)
    .bind(new.allow_concurrent)
    .fetch_one(pool)
    .await
    .context("failed to insert scheduled action")?;

    Ok(action)
}

/// Fetch a single action by ID.
pub async fn get_action(pool: &PgPool, id: i32) -> Result<Option<ScheduledAction>> {
    let action =
        sqlx::query_as::<_, ScheduledAction>("SELECT * FROM scheduled_actions WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .context("failed to fetch scheduled action")?;

    Ok(action)
}

/// List all actions, oldest first.
pub async fn list_actions(pool: &PgPool) -> Result<Vec<ScheduledAction>> {
    let actions =
        sqlx::query_as::<_, ScheduledAction>("SELECT * FROM scheduled_actions ORDER BY id ASC")
            .fetch_all(pool)
            .await
            .context("failed to list scheduled actions")?;

    Ok(actions)
}

/// Load all active actions that are due at or before `now`.
pub async fn list_due_actions(
    pool: &PgPool,
    now: DateTime<Utc>,
) -> Result<Vec<ScheduledAction>> {
    let actions = sqlx::query_as::<_, ScheduledAction>(
        "SELECT * FROM scheduled_actions \
         WHERE status = 'active' AND next_run_at IS NOT NULL AND next_run_at <= $1 \
         ORDER BY next_run_at ASC",
    )
    .bind(now)
    .fetch_all(pool)
    .await
    .context("failed to list due actions")?;

    Ok(actions)
}

/// Update an action's status.
pub async fn update_action_status(pool: &PgPool, id: i32, status: ActionStatus) -> Result<()> {
    let result = sqlx::query("UPDATE scheduled_actions SET status = $1 WHERE id = $2")
        .bind(status)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to update action status")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("scheduled action {id} not found");
    }

    Ok(())
}

/// Advance an action after a claimed run: bump the execution counter, record
/// the outcome, and move `next_run_at` forward.
///
/// Runs on the claiming transaction so it commits atomically with the run
/// row and the advisory-lock release. A `next_run_at` of `None` combined
/// with `expire = true` retires a one-shot action.
pub async fn advance_action(
    tx: &mut Transaction<'_, Postgres>,
    id: i32,
    last_run_status: &str,
    next_run_at: Option<DateTime<Utc>>,
    expire: bool,
) -> Result<()> {
    let status = if expire { "expired" } else { "active" };
    sqlx::query(
        "UPDATE scheduled_actions \
         SET execution_count = execution_count + 1, \
             last_run_status = $1, \
             next_run_at = $2, \
             status = CASE WHEN status = 'active' THEN $3::text ELSE status END \
         WHERE id = $4",
    )
    .bind(last_run_status)
    .bind(next_run_at)
    .bind(status)
    .bind(id)
    .execute(&mut **tx)
    .await
    .context("failed to advance scheduled action")?;

    Ok(())
}

/// Move `next_run_at` forward without recording an execution.
///
/// Used by crash recovery when the missed window was already claimed by
/// another instance (or by this one before it crashed).
pub async fn advance_next_run_only(
    pool: &PgPool,
    id: i32,
    next_run_at: Option<DateTime<Utc>>,
    expire: bool,
) -> Result<()> {
    let status = if expire { "expired" } else { "active" };
    sqlx::query(
        "UPDATE scheduled_actions \
         SET next_run_at = $1, \
             status = CASE WHEN status = 'active' THEN $2::text ELSE status END \
         WHERE id = $3",
    )
    .bind(next_run_at)
    .bind(status)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to advance next_run_at")?;

    Ok(())
}
