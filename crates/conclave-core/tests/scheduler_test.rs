//! Integration tests for the scheduler: due-action dispatch, schedule
//! advancement, exactly-once claims across instances, and crash-recovery
//! deduplication.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use sqlx::PgPool;

use conclave_core::config::CoreConfig;
use conclave_core::events::TracingEventSink;
use conclave_core::pipeline::manager::RunManager;
use conclave_core::ports::{LogNotifier, NoHttpCaller, NullAgentRegistry};
use conclave_core::scheduler::Scheduler;
use conclave_core::scheduler::actions::ActionDispatcher;
use conclave_db::models::{
    ActionKind, ActionRunStatus, ActionStatus, RunStatus, ScheduleKind, ScheduledAction,
    TriggeredBy,
};
use conclave_db::queries::{action_runs, actions, pipeline_runs, pipelines};
use conclave_test_utils::{create_test_db, drop_test_db};

fn scheduler_for(pool: &PgPool) -> Arc<Scheduler> {
    let dispatcher = Arc::new(ActionDispatcher::new(
        pool.clone(),
        Arc::new(RunManager::default()),
        Arc::new(TracingEventSink),
        Arc::new(NullAgentRegistry),
        Arc::new(LogNotifier),
        Arc::new(NoHttpCaller),
    ));
    let config = CoreConfig::from_lookup(|name| match name {
        "SCHEDULER_CHECK_INTERVAL_S" => Some("1".to_string()),
        "SCHEDULER_JITTER_S" => Some("0".to_string()),
        _ => None,
    });
    Arc::new(Scheduler::new(pool.clone(), dispatcher, &config))
}

async fn insert_interval_action(
    pool: &PgPool,
    config: &serde_json::Value,
    kind: ActionKind,
) -> ScheduledAction {
    actions::insert_action(
        pool,
        &actions::NewScheduledAction {
            agent_id: "agent-1",
            kind,
            config,
            schedule_kind: ScheduleKind::Interval,
            cron_expression: None,
            interval_s: Some(600),
            run_at: None,
            event_name: None,
            next_run_at: Some(Utc::now() - chrono::Duration::seconds(5)),
            timeout_s: 30,
            max_retries: 0,
            retry_delay_s: 60,
            allow_concurrent: false,
        },
    )
    .await
    .expect("insert action")
}

/// Poll until the action has a run row in a terminal state (or panic).
async fn wait_for_run(pool: &PgPool, action_id: i32) -> Vec<conclave_db::models::ScheduledActionRun> {
    for _ in 0..100 {
        let runs = action_runs::list_action_runs(pool, action_id)
            .await
            .expect("list runs");
        if runs
            .iter()
            .any(|r| r.status != ActionRunStatus::Pending && r.status != ActionRunStatus::Running)
        {
            return runs;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("action {action_id} never produced a finished run");
}

#[tokio::test]
async fn tick_dispatches_due_action_and_advances_schedule() {
    let (pool, db_name) = create_test_db().await;
    let scheduler = scheduler_for(&pool);

    let config = json!({"goal": "compile the weekly digest"});
    let action = insert_interval_action(&pool, &config, ActionKind::RunTask).await;

    scheduler.tick().await.expect("tick");
    let runs = wait_for_run(&pool, action.id).await;

    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, ActionRunStatus::Completed);
    assert_eq!(runs[0].triggered_by, TriggeredBy::Scheduler);

    let stored = actions::get_action(&pool, action.id)
        .await
        .expect("get action")
        .expect("exists");
    assert_eq!(stored.execution_count, 1);
    assert_eq!(stored.last_run_status.as_deref(), Some("completed"));
    assert!(
        stored.next_run_at.expect("next_run_at") > Utc::now(),
        "interval schedule advances past now"
    );

    // The running flag drains once the claim task finishes.
    for _ in 0..50 {
        if scheduler.running_actions().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(scheduler.running_actions().is_empty());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn once_action_expires_after_claim() {
    let (pool, db_name) = create_test_db().await;
    let scheduler = scheduler_for(&pool);

    let config = json!({"goal": "one shot"});
    let action = actions::insert_action(
        &pool,
        &actions::NewScheduledAction {
            agent_id: "agent-1",
            kind: ActionKind::RunTask,
            config: &config,
            schedule_kind: ScheduleKind::Once,
            cron_expression: None,
            interval_s: None,
            run_at: Some(Utc::now() - chrono::Duration::seconds(5)),
            event_name: None,
            next_run_at: Some(Utc::now() - chrono::Duration::seconds(5)),
            timeout_s: 30,
            max_retries: 0,
            retry_delay_s: 60,
            allow_concurrent: false,
        },
    )
    .await
    .expect("insert action");

    scheduler.tick().await.expect("tick");
    wait_for_run(&pool, action.id).await;

    let stored = actions::get_action(&pool, action.id)
        .await
        .expect("get action")
        .expect("exists");
    assert_eq!(stored.status, ActionStatus::Expired);
    assert!(stored.next_run_at.is_none());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn concurrent_claims_are_exactly_once() {
    let (pool, db_name) = create_test_db().await;

    // Two schedulers over the same store model two instances.
    let instance_a = scheduler_for(&pool);
    let instance_b = scheduler_for(&pool);

    let config = json!({"goal": "contended"});
    let action = insert_interval_action(&pool, &config, ActionKind::RunTask).await;

    let (a, b) = tokio::join!(
        instance_a.claim(&action, TriggeredBy::Scheduler),
        instance_b.claim(&action, TriggeredBy::Scheduler),
    );
    let a = a.expect("claim a");
    let b = b.expect("claim b");

    assert!(a ^ b, "exactly one instance must win the claim (a={a}, b={b})");

    // The losing instance recorded nothing.
    let runs = action_runs::list_action_runs(&pool, action.id)
        .await
        .expect("list runs");
    assert_eq!(runs.len(), 1);

    let stored = actions::get_action(&pool, action.id)
        .await
        .expect("get action")
        .expect("exists");
    assert_eq!(stored.execution_count, 1);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn recovery_skips_already_claimed_window() {
    let (pool, db_name) = create_test_db().await;
    let scheduler = scheduler_for(&pool);

    let config = json!({"goal": "missed"});
    let action = insert_interval_action(&pool, &config, ActionKind::RunTask).await;

    // Model the crash: the action missed its window two minutes ago, but a
    // run 130s ago already claimed it.
    let now = Utc::now();
    sqlx::query("UPDATE scheduled_actions SET next_run_at = $1 WHERE id = $2")
        .bind(now - chrono::Duration::seconds(120))
        .bind(action.id)
        .execute(&pool)
        .await
        .expect("backdate action");

    action_runs::insert_action_run_direct(
        &pool,
        action.id,
        now - chrono::Duration::seconds(130),
        TriggeredBy::Scheduler,
        ActionRunStatus::Completed,
    )
    .await
    .expect("insert prior run");

    scheduler.recover_missed().await.expect("recover");
    // Recovery advances synchronously in the claimed branch; give any
    // stray spawn a moment to land before asserting.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let runs = action_runs::list_action_runs(&pool, action.id)
        .await
        .expect("list runs");
    assert_eq!(runs.len(), 1, "no recovery dispatch for a claimed window");

    let stored = actions::get_action(&pool, action.id)
        .await
        .expect("get action")
        .expect("exists");
    assert_eq!(stored.execution_count, 0, "advance-only leaves the counter");
    assert!(
        stored.next_run_at.expect("next_run_at") > now,
        "next_run_at must advance"
    );

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn recovery_dispatches_unclaimed_window_once() {
    let (pool, db_name) = create_test_db().await;
    let scheduler = scheduler_for(&pool);

    let config = json!({"goal": "missed and unclaimed"});
    let action = insert_interval_action(&pool, &config, ActionKind::RunTask).await;
    sqlx::query("UPDATE scheduled_actions SET next_run_at = $1 WHERE id = $2")
        .bind(Utc::now() - chrono::Duration::seconds(120))
        .bind(action.id)
        .execute(&pool)
        .await
        .expect("backdate action");

    scheduler.recover_missed().await.expect("recover");
    let runs = wait_for_run(&pool, action.id).await;

    assert_eq!(runs.len(), 1, "exactly one recovery dispatch");
    assert_eq!(runs[0].triggered_by, TriggeredBy::Recovery);
    assert_eq!(runs[0].status, ActionRunStatus::Completed);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn misconfigured_action_reports_failure_without_crashing() {
    let (pool, db_name) = create_test_db().await;
    let scheduler = scheduler_for(&pool);

    // run_task with no goal: the handler fails, the loop keeps going.
    let config = json!({});
    let action = insert_interval_action(&pool, &config, ActionKind::RunTask).await;

    scheduler.tick().await.expect("tick");
    let runs = wait_for_run(&pool, action.id).await;

    assert_eq!(runs[0].status, ActionRunStatus::Failed);
    assert!(runs[0].error.as_deref().unwrap_or("").contains("goal"));

    let stored = actions::get_action(&pool, action.id)
        .await
        .expect("get action")
        .expect("exists");
    assert_eq!(stored.last_run_status.as_deref(), Some("failed"));
    assert!(stored.next_run_at.expect("next_run_at") > Utc::now());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn execute_pipeline_action_runs_stored_pipeline() {
    let (pool, db_name) = create_test_db().await;
    let scheduler = scheduler_for(&pool);

    let definition = json!({
        "nodes": [
            {"id": "t", "kind": "trigger"},
            {"id": "a", "kind": "agent", "config": {"agent_id": "a1", "task": "digest"}},
        ],
        "edges": [
            {"id": "e1", "from": "t", "to": "a"},
        ],
    });
    let pipeline = pipelines::insert_pipeline(&pool, "digest", &definition, 60, 0, 10, 50)
        .await
        .expect("insert pipeline");

    let config = json!({"pipeline_id": pipeline.id.to_string()});
    let action = insert_interval_action(&pool, &config, ActionKind::ExecutePipeline).await;

    scheduler.tick().await.expect("tick");
    let runs = wait_for_run(&pool, action.id).await;
    assert_eq!(runs[0].status, ActionRunStatus::Completed);

    let stored_runs = pipeline_runs::list_runs(&pool, 10).await.expect("list runs");
    assert_eq!(stored_runs.len(), 1);
    assert_eq!(stored_runs[0].status, RunStatus::Completed);
    assert_eq!(
        stored_runs[0].trigger_data["scheduled_action_id"],
        json!(action.id)
    );

    pool.close().await;
    drop_test_db(&db_name).await;
}
