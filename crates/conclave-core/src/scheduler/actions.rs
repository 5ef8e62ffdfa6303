//! Action dispatch: maps a scheduled action's kind to its handler.
//!
//! Handlers never propagate errors to the scheduler loop; every failure
//! becomes a `failed` outcome recorded on the action's run row.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde_json::{Value, json};
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use conclave_db::models::{ActionKind, ActionRunStatus, PipelineRun, RunStatus, ScheduledAction};
use conclave_db::queries::{pipeline_runs, pipelines};

use crate::cache::TtlCache;
use crate::events::EventSink;
use crate::pipeline::PipelineDefinition;
use crate::pipeline::executor::PipelineExecutor;
use crate::pipeline::manager::RunManager;
use crate::pipeline::node::NodeDispatcher;
use crate::ports::{AgentRegistry, HttpCaller, Notifier};

/// How long parsed pipeline definitions stay cached.
const DEFINITION_CACHE_TTL: Duration = Duration::from_secs(60);

/// Result of dispatching one scheduled action.
#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub status: ActionRunStatus,
    pub summary: String,
    pub error: Option<String>,
}

impl ActionOutcome {
    fn completed(summary: impl Into<String>) -> Self {
        Self {
            status: ActionRunStatus::Completed,
            summary: summary.into(),
            error: None,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            status: ActionRunStatus::Failed,
            summary: error.clone(),
            error: Some(error),
        }
    }
}

/// Routes scheduled actions to their handlers.
///
/// Depends only on ports and the run manager; all capability wiring happens
/// at construction.
pub struct ActionDispatcher {
    pool: PgPool,
    run_manager: Arc<RunManager>,
    node_dispatcher: Arc<NodeDispatcher>,
    events: Arc<dyn EventSink>,
    agents: Arc<dyn AgentRegistry>,
    notifier: Arc<dyn Notifier>,
    http: Arc<dyn HttpCaller>,
    definitions: Mutex<TtlCache<Uuid, Arc<PipelineDefinition>>>,
}

impl ActionDispatcher {
    pub fn new(
        pool: PgPool,
        run_manager: Arc<RunManager>,
        events: Arc<dyn EventSink>,
        agents: Arc<dyn AgentRegistry>,
        notifier: Arc<dyn Notifier>,
        http: Arc<dyn HttpCaller>,
    ) -> Self {
        let node_dispatcher = Arc::new(NodeDispatcher::new(
            Arc::clone(&agents),
            Arc::clone(&notifier),
            Arc::clone(&http),
        ));
        Self {
            pool,
            run_manager,
            node_dispatcher,
            events,
            agents,
            notifier,
            http,
            definitions: Mutex::new(TtlCache::new(DEFINITION_CACHE_TTL)),
        }
    }

    pub fn run_manager(&self) -> &Arc<RunManager> {
        &self.run_manager
    }

    /// Dispatch one action and report its outcome. Never errors: handler
    /// failures are folded into a failed outcome.
    pub async fn dispatch(&self, action: &ScheduledAction) -> ActionOutcome {
        let result = match action.kind {
            ActionKind::RunTask => self.run_task(action).await,
            ActionKind::ExecutePipeline => self.execute_pipeline(action).await,
            ActionKind::SendNotification => self.send_notification(action).await,
            ActionKind::CallApi => self.call_api(action).await,
        };

        match result {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(
                    action_id = action.id,
                    kind = %action.kind,
                    error = %format!("{e:#}"),
                    "action handler failed"
                );
                ActionOutcome::failed(format!("{e:#}"))
            }
        }
    }

    /// `run_task`: hand the configured goal to the owning agent as a
    /// background task.
    async fn run_task(&self, action: &ScheduledAction) -> Result<ActionOutcome> {
        let goal = config_str(&action.config, "goal")
            .ok_or_else(|| anyhow!("run_task action {} has no goal", action.id))?;

        match self.agents.get(&action.agent_id) {
            Some(handle) => {
                let response = handle
                    .process(goal)
                    .await
                    .with_context(|| format!("agent {} failed", action.agent_id))?;
                Ok(ActionOutcome::completed(truncate(&response, 200)))
            }
            None => Ok(ActionOutcome::completed(format!(
                "[simulated] task for agent {}: {}",
                action.agent_id,
                truncate(goal, 120)
            ))),
        }
    }

    /// `execute_pipeline`: resolve the stored definition, create a running
    /// run row, hand it to the run manager under the action's timeout, and
    /// report the run's terminal status.
    async fn execute_pipeline(&self, action: &ScheduledAction) -> Result<ActionOutcome> {
        let pipeline_id = config_str(&action.config, "pipeline_id")
            .ok_or_else(|| anyhow!("execute_pipeline action {} has no pipeline_id", action.id))?;
        let pipeline_id = Uuid::from_str(pipeline_id)
            .with_context(|| format!("invalid pipeline_id {pipeline_id:?}"))?;

        let definition = self.load_definition(pipeline_id).await?;

        let trigger_data = json!({
            "scheduled_action_id": action.id,
            "agent_id": action.agent_id,
        });
        let run = pipeline_runs::insert_run(
            &self.pool,
            pipeline_id,
            RunStatus::Running,
            &trigger_data,
        )
        .await?;
        let run_id = run.id;

        let executor = PipelineExecutor::new(
            Arc::clone(&definition),
            Arc::clone(&self.node_dispatcher),
            Arc::clone(&self.events),
        );
        let waiter = self.run_manager.start(
            self.pool.clone(),
            run,
            executor,
            Duration::from_secs(action.timeout_s.max(1) as u64),
        );

        let status = waiter.wait().await;
        let stored = pipeline_runs::get_run(&self.pool, run_id).await?;
        let error = stored.and_then(|r| r.error);

        match status {
            Some(RunStatus::Completed) => {
                Ok(ActionOutcome::completed(format!("pipeline run {run_id} completed")))
            }
            Some(RunStatus::Timeout) => Ok(ActionOutcome {
                status: ActionRunStatus::Timeout,
                summary: format!("pipeline run {run_id} timed out"),
                error,
            }),
            Some(other) => Ok(ActionOutcome {
                status: ActionRunStatus::Failed,
                summary: format!("pipeline run {run_id} ended {other}"),
                error,
            }),
            None => Ok(ActionOutcome {
                status: ActionRunStatus::Failed,
                summary: format!("pipeline run {run_id} was torn down before reporting"),
                error,
            }),
        }
    }

    /// `send_notification`: delegate to the notifier port.
    async fn send_notification(&self, action: &ScheduledAction) -> Result<ActionOutcome> {
        let channel = config_str(&action.config, "channel").unwrap_or("default");
        let body = config_str(&action.config, "body")
            .ok_or_else(|| anyhow!("send_notification action {} has no body", action.id))?;
        let recipients: Vec<String> = action
            .config
            .get("recipients")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();

        self.notifier
            .send(channel, &recipients, body)
            .await
            .with_context(|| format!("notification to {channel} failed"))?;

        Ok(ActionOutcome::completed(format!(
            "notification sent to {channel} ({} recipients)",
            recipients.len()
        )))
    }

    /// `call_api`: delegate to the HTTP port.
    async fn call_api(&self, action: &ScheduledAction) -> Result<ActionOutcome> {
        let method = config_str(&action.config, "method").unwrap_or("GET");
        let url = config_str(&action.config, "url")
            .ok_or_else(|| anyhow!("call_api action {} has no url", action.id))?;
        let headers: HashMap<String, String> = action
            .config
            .get("headers")
            .and_then(Value::as_object)
            .map(|obj| {
                obj.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_owned())))
                    .collect()
            })
            .unwrap_or_default();
        let body = action.config.get("body").map(Value::to_string);
        let timeout = action
            .config
            .get("timeout")
            .and_then(Value::as_u64)
            .unwrap_or(30);

        let response = self
            .http
            .call(
                method,
                url,
                &headers,
                body.as_deref(),
                Duration::from_secs(timeout),
            )
            .await
            .with_context(|| format!("{method} {url} failed"))?;

        Ok(ActionOutcome::completed(format!(
            "{method} {url} -> {}",
            response.status
        )))
    }

    /// Start a pipeline run outside the scheduler (external trigger).
    ///
    /// Creates the run row and hands it to the run manager detached; the
    /// caller gets the row back immediately and can poll its status.
    pub async fn trigger_pipeline_run(
        &self,
        pipeline_id: Uuid,
        trigger_data: Value,
    ) -> Result<PipelineRun> {
        let definition = self.load_definition(pipeline_id).await?;

        let run =
            pipeline_runs::insert_run(&self.pool, pipeline_id, RunStatus::Pending, &trigger_data)
                .await?;

        let executor = PipelineExecutor::new(
            Arc::clone(&definition),
            Arc::clone(&self.node_dispatcher),
            Arc::clone(&self.events),
        );
        let timeout = definition.timeout;
        info!(run_id = %run.id, pipeline_id = %pipeline_id, "externally triggered pipeline run");
        let _waiter = self
            .run_manager
            .start(self.pool.clone(), run.clone(), executor, timeout);

        Ok(run)
    }

    /// Load and parse a pipeline definition, memoized under a short TTL.
    async fn load_definition(&self, pipeline_id: Uuid) -> Result<Arc<PipelineDefinition>> {
        if let Some(cached) = self
            .definitions
            .lock()
            .expect("definition cache poisoned")
            .get(&pipeline_id)
        {
            return Ok(cached);
        }

        let row = pipelines::get_pipeline(&self.pool, pipeline_id)
            .await?
            .ok_or_else(|| anyhow!("pipeline {pipeline_id} not found"))?;
        let definition = Arc::new(
            PipelineDefinition::parse(&row)
                .with_context(|| format!("pipeline {pipeline_id} has an invalid definition"))?,
        );

        self.definitions
            .lock()
            .expect("definition cache poisoned")
            .insert(pipeline_id, Arc::clone(&definition));

        Ok(definition)
    }

    /// Drop all cached definitions (tests; definition updates).
    pub fn clear_definition_cache(&self) {
        self.definitions
            .lock()
            .expect("definition cache poisoned")
            .clear();
    }
}

fn config_str<'a>(config: &'a Value, key: &str) -> Option<&'a str> {
    config.get(key).and_then(Value::as_str)
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_owned()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}
