//! The `conclave serve` command: wires the orchestration core, exposes the
//! readiness probe plus a small inspection API, and drives the shutdown
//! sequence on the termination signal.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use sqlx::PgPool;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use conclave_core::config::CoreConfig;
use conclave_core::events::TracingEventSink;
use conclave_core::pipeline::manager::RunManager;
use conclave_core::ports::{LogNotifier, NoHttpCaller, NullAgentRegistry};
use conclave_core::scheduler::Scheduler;
use conclave_core::scheduler::actions::ActionDispatcher;
use conclave_core::shutdown::{self, ShutdownController};
use conclave_db::models::{PipelineNodeRun, PipelineRun, ScheduledAction};
use conclave_db::queries::{actions as action_db, node_runs, pipeline_runs};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn internal(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{err:#}"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// State & router
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pool: PgPool,
    dispatcher: Arc<ActionDispatcher>,
}

/// Build the application state with default (unwired) capability ports.
pub fn build_state(pool: PgPool) -> AppState {
    let run_manager = Arc::new(RunManager::default());
    let dispatcher = Arc::new(ActionDispatcher::new(
        pool.clone(),
        run_manager,
        Arc::new(TracingEventSink),
        Arc::new(NullAgentRegistry),
        Arc::new(LogNotifier),
        Arc::new(NoHttpCaller),
    ));
    AppState { pool, dispatcher }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ready", get(ready))
        .route("/api/runs", get(list_runs))
        .route("/api/runs/{id}", get(get_run_detail))
        .route("/api/actions", get(list_actions))
        .route("/api/pipelines/{id}/runs", post(trigger_run))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(pool: PgPool, bind: &str, port: u16) -> Result<()> {
    let config = CoreConfig::from_env();
    let state = build_state(pool.clone());

    // Background scheduler.
    let scheduler = Arc::new(Scheduler::new(
        pool.clone(),
        Arc::clone(&state.dispatcher),
        &config,
    ));
    let scheduler_stop = scheduler.stop_token();
    let scheduler_task = tokio::spawn(Arc::clone(&scheduler).run());

    let run_manager = Arc::clone(state.dispatcher.run_manager());
    let app = build_router(state);

    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("conclave serve listening on http://{addr}");

    // The probe must keep answering (with 503) during the drain windows, so
    // the HTTP server outlives the shutdown sequence instead of gating it.
    let (server_done_tx, server_done_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = server_done_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    tracing::info!("termination signal received");

    let controller = ShutdownController::from_config(&config);
    controller
        .run(scheduler_stop, Some(scheduler_task), &run_manager, &pool)
        .await;

    let _ = server_done_tx.send(());
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "http server ended abnormally"),
        Err(e) => tracing::warn!(error = %e, "http server task panicked"),
    }

    tracing::info!("conclave serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Readiness probe for external load balancers.
async fn ready() -> axum::response::Response {
    if shutdown::is_shutting_down() {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"ready": false, "reason": "shutting_down"})),
        )
            .into_response()
    } else {
        (StatusCode::OK, Json(serde_json::json!({"ready": true}))).into_response()
    }
}

async fn list_runs(State(state): State<AppState>) -> Result<Json<Vec<PipelineRun>>, AppError> {
    let runs = pipeline_runs::list_runs(&state.pool, 100)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(runs))
}

#[derive(serde::Serialize)]
struct RunDetailResponse {
    #[serde(flatten)]
    run: PipelineRun,
    node_runs: Vec<PipelineNodeRun>,
}

async fn get_run_detail(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<RunDetailResponse>, AppError> {
    let run = pipeline_runs::get_run(&state.pool, id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("run {id} not found")))?;

    let node_runs = node_runs::list_node_runs(&state.pool, id)
        .await
        .map_err(AppError::internal)?;

    Ok(Json(RunDetailResponse { run, node_runs }))
}

async fn list_actions(
    State(state): State<AppState>,
) -> Result<Json<Vec<ScheduledAction>>, AppError> {
    let actions = action_db::list_actions(&state.pool)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(actions))
}

/// External trigger: start a run of a stored pipeline.
async fn trigger_run(
    State(state): State<AppState>,
    Path(pipeline_id): Path<Uuid>,
    body: Option<Json<serde_json::Value>>,
) -> Result<(StatusCode, Json<PipelineRun>), AppError> {
    let trigger_data = body
        .map(|Json(v)| v)
        .unwrap_or_else(|| serde_json::json!({}));
    if !trigger_data.is_object() {
        return Err(AppError::bad_request("trigger data must be a JSON object"));
    }

    let run = state
        .dispatcher
        .trigger_pipeline_run(pipeline_id, trigger_data)
        .await
        .map_err(AppError::internal)?;

    Ok((StatusCode::ACCEPTED, Json(run)))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
