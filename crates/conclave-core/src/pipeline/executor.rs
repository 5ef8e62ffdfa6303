//! Pipeline executor: drives one run of one validated pipeline from start
//! to terminal state.
//!
//! The executor walks the static topological order and, per node, applies
//! the skip-propagation gate, the cancellation gate, the circuit-breaker
//! gate, and the retry wrapper, persisting a node-run row and emitting
//! lifecycle events as it goes. The run's disposition on a node failure is
//! stop-and-fail: nothing downstream of a failed node executes.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde_json::{Map, Value};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use conclave_db::models::{NodeRunStatus, PipelineRun, RunStatus};
use conclave_db::queries::node_runs::{self, NewNodeRun};
use conclave_db::queries::pipeline_runs;

use crate::breaker::CircuitBreaker;
use crate::events::{self, EventSink, OrchestrationEvent};

use super::node::{NodeContext, NodeDispatcher, NodeError};
use super::{Node, NodeKind, PipelineDefinition};

/// Executes a single pipeline run.
///
/// Cancellation is cooperative: the run manager sets the token and the
/// executor observes it between nodes (handlers with long suspensions, like
/// `delay`, observe it themselves).
pub struct PipelineExecutor {
    definition: Arc<PipelineDefinition>,
    dispatcher: Arc<NodeDispatcher>,
    events: Arc<dyn EventSink>,
    cancel: CancellationToken,
}

impl PipelineExecutor {
    pub fn new(
        definition: Arc<PipelineDefinition>,
        dispatcher: Arc<NodeDispatcher>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            definition,
            dispatcher,
            events,
            cancel: CancellationToken::new(),
        }
    }

    /// The cooperative cancel flag for this run.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request cooperative cancellation.
    pub fn request_cancel(&self) {
        self.cancel.cancel();
    }

    pub fn events(&self) -> Arc<dyn EventSink> {
        Arc::clone(&self.events)
    }

    pub fn definition(&self) -> &PipelineDefinition {
        &self.definition
    }

    /// Run the pipeline to a terminal state, returning the status written.
    ///
    /// Store failures while persisting node rows are logged and swallowed;
    /// only a failure to compute the traversal itself fails the run.
    pub async fn run(&self, pool: &PgPool, run: &PipelineRun) -> Result<RunStatus> {
        let run_id = run.id;

        if let Err(e) = pipeline_runs::mark_running(pool, run_id).await {
            warn!(run_id = %run_id, error = %e, "failed to mark run running");
        }
        events::emit(
            self.events.as_ref(),
            OrchestrationEvent::RunStarted {
                run_id,
                pipeline_id: self.definition.id,
            },
        );

        let order = match self.definition.topological_order() {
            Ok(order) => order,
            Err(e) => {
                let error = format!("definition is not executable: {e}");
                return Ok(self.finish(pool, run_id, RunStatus::Failed, Some(&error)).await);
            }
        };
        let preds = self.definition.predecessors();
        let succs = self.definition.successors();

        let ctx = NodeContext {
            run_id,
            trigger_data: run.trigger_data.clone(),
            cancel: self.cancel.clone(),
        };

        // Trigger data is pre-populated as the output of every trigger node.
        let mut outputs: Map<String, Value> = Map::new();
        for node in &self.definition.nodes {
            if node.kind == NodeKind::Trigger {
                outputs.insert(node.id.clone(), run.trigger_data.clone());
            }
        }

        let mut skipped: HashSet<String> = HashSet::new();
        let mut breakers: HashMap<String, CircuitBreaker> = HashMap::new();
        let mut failure: Option<(String, NodeError)> = None;

        for node_id in &order {
            let Some(node) = self.definition.node(node_id) else {
                continue;
            };
            let node_preds = preds.get(node_id.as_str());

            // 1. Skip gate: swept by an upstream condition, or all
            //    predecessors skipped.
            let all_preds_skipped = node_preds
                .is_some_and(|ps| !ps.is_empty() && ps.iter().all(|p| skipped.contains(*p)));
            if skipped.contains(node_id) || all_preds_skipped {
                skipped.insert(node_id.clone());
                self.persist_node_full(
                    pool,
                    run_id,
                    node,
                    NodeRunStatus::Skipped,
                    None,
                    None,
                    None,
                    0,
                    None,
                    0,
                )
                .await;
                events::emit(
                    self.events.as_ref(),
                    OrchestrationEvent::NodeSkipped {
                        run_id,
                        node_id: node_id.clone(),
                    },
                );
                continue;
            }

            // 2. Cancellation gate, checked between nodes only.
            if self.cancel.is_cancelled() {
                return Ok(self
                    .finish(pool, run_id, RunStatus::Cancelled, Some("run cancelled"))
                    .await);
            }

            if let Err(e) = pipeline_runs::set_current_node(pool, run_id, node_id).await {
                warn!(run_id = %run_id, node_id = %node_id, error = %e, "failed to set current node");
            }

            let inputs: Map<String, Value> = node_preds
                .into_iter()
                .flatten()
                .filter_map(|p| outputs.get(*p).map(|v| ((*p).to_string(), v.clone())))
                .collect();

            events::emit(
                self.events.as_ref(),
                OrchestrationEvent::NodeStarted {
                    run_id,
                    node_id: node_id.clone(),
                },
            );

            // Per-(run, node) breaker: created on the node's first attempt,
            // dropped with the run.
            let breaker = breakers.entry(node_id.clone()).or_default();

            let started_at = Utc::now();
            let t0 = tokio::time::Instant::now();
            let (result, retry_count) =
                self.run_node_with_breaker(node, &inputs, &ctx, breaker).await;
            let duration_ms = t0.elapsed().as_millis() as i64;

            let input_summary = Value::Object(inputs);
            match result {
                Ok(output) => {
                    self.persist_node_full(
                        pool,
                        run_id,
                        node,
                        NodeRunStatus::Completed,
                        Some(&input_summary),
                        Some(&output),
                        None,
                        retry_count,
                        Some(started_at),
                        duration_ms,
                    )
                    .await;
                    events::emit(
                        self.events.as_ref(),
                        OrchestrationEvent::NodeCompleted {
                            run_id,
                            node_id: node_id.clone(),
                        },
                    );

                    // A falsy condition sweeps its downstream-only
                    // successors into the skip set.
                    let condition_false = node.kind == NodeKind::Condition
                        && !output
                            .get("result")
                            .and_then(Value::as_bool)
                            .unwrap_or(false);
                    outputs.insert(node_id.clone(), output);
                    if condition_false {
                        sweep_skip(node_id, &succs, &preds, &mut skipped);
                        debug!(
                            run_id = %run_id,
                            condition = %node_id,
                            skipped = skipped.len(),
                            "condition false, downstream nodes skipped"
                        );
                    }
                }
                Err(NodeError::Cancelled) => {
                    self.persist_node_full(
                        pool,
                        run_id,
                        node,
                        NodeRunStatus::Cancelled,
                        Some(&input_summary),
                        None,
                        Some("cancelled"),
                        retry_count,
                        Some(started_at),
                        duration_ms,
                    )
                    .await;
                    return Ok(self
                        .finish(pool, run_id, RunStatus::Cancelled, Some("run cancelled"))
                        .await);
                }
                Err(e) => {
                    let error = e.to_string();
                    self.persist_node_full(
                        pool,
                        run_id,
                        node,
                        NodeRunStatus::Failed,
                        Some(&input_summary),
                        None,
                        Some(&error),
                        retry_count,
                        Some(started_at),
                        duration_ms,
                    )
                    .await;
                    events::emit(
                        self.events.as_ref(),
                        OrchestrationEvent::NodeFailed {
                            run_id,
                            node_id: node_id.clone(),
                            error,
                        },
                    );
                    failure = Some((node_id.clone(), e));
                    // Stop-and-fail: nothing downstream of a failed node.
                    break;
                }
            }
        }

        let status = match failure {
            Some((node_id, e)) => {
                let error = format!("node {node_id} failed: {e}");
                self.finish(pool, run_id, RunStatus::Failed, Some(&error)).await
            }
            None => {
                if self.cancel.is_cancelled() {
                    self.finish(pool, run_id, RunStatus::Cancelled, Some("run cancelled"))
                        .await
                } else {
                    self.finish(pool, run_id, RunStatus::Completed, None).await
                }
            }
        };
        Ok(status)
    }

    /// Execute one node under the breaker gate and the retry wrapper.
    ///
    /// Returns the result and the number of retries consumed. Breaker
    /// accounting happens on the node's terminal outcome: success records a
    /// success, an executed terminal failure records a failure, and a
    /// breaker rejection records nothing (the handler never ran).
    pub async fn run_node_with_breaker(
        &self,
        node: &Node,
        inputs: &Map<String, Value>,
        ctx: &NodeContext,
        breaker: &mut CircuitBreaker,
    ) -> (Result<Value, NodeError>, i32) {
        // 3. Breaker gate: an open breaker fails the node without consuming
        //    a retry or invoking the handler.
        if let Err(open) = breaker.check() {
            return (Err(NodeError::Execution(open.to_string())), 0);
        }

        let max_retries = self.definition.max_retries_per_node;
        let mut retry_count: u32 = 0;

        // 4. Retry wrapper: transient failures only, exponential backoff.
        let result = loop {
            match self.dispatcher.dispatch(node, inputs, ctx).await {
                Ok(output) => {
                    breaker.record_success();
                    break Ok(output);
                }
                Err(NodeError::Cancelled) => break Err(NodeError::Cancelled),
                Err(e @ NodeError::Config(_)) => break Err(e),
                Err(e @ NodeError::Execution(_)) => {
                    if retry_count < max_retries {
                        retry_count += 1;
                        events::emit(
                            self.events.as_ref(),
                            OrchestrationEvent::NodeRetrying {
                                run_id: ctx.run_id,
                                node_id: node.id.clone(),
                                retry: retry_count,
                            },
                        );
                        tokio::time::sleep(backoff_delay(
                            self.definition.retry_backoff_base,
                            self.definition.retry_backoff_max,
                            retry_count,
                        ))
                        .await;
                    } else {
                        breaker.record_failure();
                        break Err(e);
                    }
                }
            }
        };

        (result, retry_count as i32)
    }

    /// Write the run's terminal status (write-once) and emit the matching
    /// event iff this writer won.
    async fn finish(
        &self,
        pool: &PgPool,
        run_id: uuid::Uuid,
        status: RunStatus,
        error: Option<&str>,
    ) -> RunStatus {
        match pipeline_runs::finish_run(pool, run_id, status, error).await {
            Ok(0) => {
                // Another writer (timeout guard, forced cancel) already
                // landed a terminal status.
                debug!(run_id = %run_id, status = %status, "terminal status already written");
            }
            Ok(_) => {
                let event = match status {
                    RunStatus::Completed => OrchestrationEvent::RunCompleted { run_id },
                    RunStatus::Cancelled => OrchestrationEvent::RunCancelled { run_id },
                    RunStatus::Timeout => OrchestrationEvent::RunTimeout { run_id },
                    _ => OrchestrationEvent::RunFailed {
                        run_id,
                        error: error.unwrap_or("unknown error").to_string(),
                    },
                };
                events::emit(self.events.as_ref(), event);
            }
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "failed to write terminal run status");
            }
        }
        status
    }

    /// Best-effort node-run persistence: a store failure must not kill the
    /// run, so it is logged and swallowed.
    #[allow(clippy::too_many_arguments)]
    async fn persist_node_full(
        &self,
        pool: &PgPool,
        run_id: uuid::Uuid,
        node: &Node,
        status: NodeRunStatus,
        input_summary: Option<&Value>,
        output_summary: Option<&Value>,
        error: Option<&str>,
        retry_count: i32,
        started_at: Option<chrono::DateTime<Utc>>,
        duration_ms: i64,
    ) {
        let new = NewNodeRun {
            run_id,
            node_id: &node.id,
            kind: node.kind.as_str(),
            status,
            input_summary,
            output_summary,
            error,
            retry_count,
            started_at,
            completed_at: Some(Utc::now()),
            duration_ms: started_at.map(|_| duration_ms),
        };
        if let Err(e) = node_runs::insert_node_run(pool, &new).await {
            warn!(
                run_id = %run_id,
                node_id = %node.id,
                error = %e,
                "failed to persist node run (swallowed)"
            );
        }
    }
}

/// Exponential backoff: `base * 2^(retry-1)`, capped at `max`.
fn backoff_delay(base: Duration, max: Duration, retry: u32) -> Duration {
    let factor = 2u32.saturating_pow(retry.saturating_sub(1));
    base.saturating_mul(factor).min(max)
}

/// Breadth-first sweep over a falsy condition's downstream-only successors.
///
/// A successor joins the skip set when every predecessor is already skipped
/// or is the condition node itself -- the condition counts as a skip source
/// even though it completed, otherwise its own completion would block the
/// sweep. A node that is also reachable from a live (non-skipped) branch
/// keeps running.
fn sweep_skip(
    condition: &str,
    succs: &HashMap<&str, std::collections::BTreeSet<&str>>,
    preds: &HashMap<&str, std::collections::BTreeSet<&str>>,
    skipped: &mut HashSet<String>,
) {
    let mut queue: VecDeque<&str> = succs
        .get(condition)
        .into_iter()
        .flatten()
        .copied()
        .collect();

    while let Some(candidate) = queue.pop_front() {
        if skipped.contains(candidate) {
            continue;
        }
        let eligible = preds
            .get(candidate)
            .is_some_and(|ps| ps.iter().all(|p| *p == condition || skipped.contains(*p)));
        if eligible {
            skipped.insert(candidate.to_string());
            queue.extend(succs.get(candidate).into_iter().flatten().copied());
        }
    }
}
