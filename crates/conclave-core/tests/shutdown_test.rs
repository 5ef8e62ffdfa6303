//! Integration tests for the shutdown controller's ordering invariants.
//!
//! The readiness flag is process-wide, so these tests serialize on a local
//! mutex instead of relying on cargo's default parallelism.

use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use serde_json::json;

use conclave_core::config::CoreConfig;
use conclave_core::events::TracingEventSink;
use conclave_core::pipeline::PipelineDefinition;
use conclave_core::pipeline::executor::PipelineExecutor;
use conclave_core::pipeline::manager::RunManager;
use conclave_core::pipeline::node::NodeDispatcher;
use conclave_core::ports::{LogNotifier, NoHttpCaller, NullAgentRegistry};
use conclave_core::scheduler::Scheduler;
use conclave_core::scheduler::actions::ActionDispatcher;
use conclave_core::shutdown::{self, ShutdownController};
use conclave_db::models::RunStatus;
use conclave_db::queries::{pipeline_runs, pipelines};
use conclave_test_utils::{create_test_db, drop_test_db};

fn flag_guard() -> &'static Mutex<()> {
    static GUARD: OnceLock<Mutex<()>> = OnceLock::new();
    GUARD.get_or_init(|| Mutex::new(()))
}

fn test_config() -> CoreConfig {
    CoreConfig::from_lookup(|name| match name {
        "SCHEDULER_CHECK_INTERVAL_S" => Some("1".to_string()),
        "SCHEDULER_JITTER_S" => Some("0".to_string()),
        "SHUTDOWN_LB_DRAIN_S" => Some("1".to_string()),
        "SHUTDOWN_TASK_DRAIN_S" => Some("0".to_string()),
        "SHUTDOWN_POOL_CLOSE_TIMEOUT_S" => Some("5".to_string()),
        _ => None,
    })
}

#[tokio::test]
async fn readiness_flips_before_scheduler_stops_and_pool_closes_last() {
    let _guard = flag_guard().lock().expect("flag guard");
    shutdown::reset_shutting_down();

    let (pool, db_name) = create_test_db().await;
    let config = test_config();

    let run_manager = Arc::new(RunManager::default());
    let dispatcher = Arc::new(ActionDispatcher::new(
        pool.clone(),
        Arc::clone(&run_manager),
        Arc::new(TracingEventSink),
        Arc::new(NullAgentRegistry),
        Arc::new(LogNotifier),
        Arc::new(NoHttpCaller),
    ));
    let scheduler = Arc::new(Scheduler::new(pool.clone(), dispatcher, &config));
    let stop_token = scheduler.stop_token();
    let scheduler_task = tokio::spawn(Arc::clone(&scheduler).run());

    let controller = ShutdownController::from_config(&config);
    let controller_task = {
        let stop = stop_token.clone();
        let manager = Arc::clone(&run_manager);
        let pool = pool.clone();
        tokio::spawn(async move {
            controller.run(stop, Some(scheduler_task), &manager, &pool).await;
        })
    };

    // Mid lb-drain: readiness already failing, scheduler not yet stopped.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(
        shutdown::is_shutting_down(),
        "readiness must flip before anything else"
    );
    assert!(
        !stop_token.is_cancelled(),
        "scheduler keeps running through the load-balancer drain window"
    );
    assert!(!pool.is_closed(), "pool must close last");

    controller_task.await.expect("shutdown sequence");

    assert!(stop_token.is_cancelled(), "scheduler stopped");
    assert!(pool.is_closed(), "pool closed at the end of the sequence");

    shutdown::reset_shutting_down();
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn shutdown_drains_inflight_run_before_closing_pool() {
    let _guard = flag_guard().lock().expect("flag guard");
    shutdown::reset_shutting_down();

    let (pool, db_name) = create_test_db().await;
    let config = test_config();

    // A run sitting in a long delay node.
    let definition_json = json!({
        "nodes": [
            {"id": "t", "kind": "trigger"},
            {"id": "wait", "kind": "delay", "config": {"seconds": 20}},
        ],
        "edges": [{"id": "e1", "from": "t", "to": "wait"}],
    });
    let row = pipelines::insert_pipeline(&pool, "long", &definition_json, 60, 0, 10, 50)
        .await
        .expect("insert pipeline");
    let definition = Arc::new(PipelineDefinition::parse(&row).expect("parse"));

    let run_manager = Arc::new(RunManager::default());
    let node_dispatcher = Arc::new(NodeDispatcher::new(
        Arc::new(NullAgentRegistry),
        Arc::new(LogNotifier),
        Arc::new(NoHttpCaller),
    ));
    let executor = PipelineExecutor::new(
        Arc::clone(&definition),
        node_dispatcher,
        Arc::new(TracingEventSink),
    );
    let run = pipeline_runs::insert_run(&pool, definition.id, RunStatus::Pending, &json!({}))
        .await
        .expect("insert run");
    let run_id = run.id;
    let _waiter = run_manager.start(pool.clone(), run, executor, Duration::from_secs(60));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(run_manager.is_active(run_id));

    let dispatcher = Arc::new(ActionDispatcher::new(
        pool.clone(),
        Arc::clone(&run_manager),
        Arc::new(TracingEventSink),
        Arc::new(NullAgentRegistry),
        Arc::new(LogNotifier),
        Arc::new(NoHttpCaller),
    ));
    let scheduler = Arc::new(Scheduler::new(pool.clone(), dispatcher, &config));
    let stop_token = scheduler.stop_token();
    let scheduler_task = tokio::spawn(Arc::clone(&scheduler).run());

    let controller = ShutdownController::from_config(&config);
    controller
        .run(stop_token, Some(scheduler_task), &run_manager, &pool)
        .await;

    // The run was cancelled (its terminal status written through the pool)
    // strictly before the pool closed.
    assert!(run_manager.active_runs().is_empty(), "no live runs survive shutdown");
    assert!(pool.is_closed());

    // A second pool confirms what got persisted.
    let verify_url = format!("{}/{}", conclave_test_utils::pg_url().await, db_name);
    let verify_pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(1)
        .connect(&verify_url)
        .await
        .expect("reconnect for verification");
    let stored = pipeline_runs::get_run(&verify_pool, run_id)
        .await
        .expect("get run")
        .expect("run exists");
    assert_eq!(stored.status, RunStatus::Cancelled);
    verify_pool.close().await;

    shutdown::reset_shutting_down();
    drop_test_db(&db_name).await;
}
