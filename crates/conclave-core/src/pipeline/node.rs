//! Node dispatch: maps a node kind to its typed handler.
//!
//! Handlers classify their own failures: configuration problems are
//! [`NodeError::Config`] (never retried), runtime problems are
//! [`NodeError::Execution`] (retried under the pipeline's policy).

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value, json};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::ports::{AgentRegistry, HttpCaller, Notifier};

use super::{Node, NodeKind};

/// Failure of a single node dispatch.
#[derive(Debug, Clone, Error)]
pub enum NodeError {
    /// The node's configuration is malformed for its kind. Not retried.
    #[error("node configuration invalid: {0}")]
    Config(String),

    /// The handler failed at runtime. Eligible for retry.
    #[error("node execution failed: {0}")]
    Execution(String),

    /// The run's cooperative cancel landed while the handler was suspended.
    #[error("node cancelled")]
    Cancelled,
}

impl NodeError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Execution(_))
    }
}

/// Per-run context handed to every handler.
#[derive(Debug, Clone)]
pub struct NodeContext {
    pub run_id: Uuid,
    pub trigger_data: Value,
    pub cancel: CancellationToken,
}

/// Maps a node kind to a typed handler and routes predecessor outputs in.
///
/// Owns the capability ports, wired once at construction.
pub struct NodeDispatcher {
    agents: Arc<dyn AgentRegistry>,
    notifier: Arc<dyn Notifier>,
    http: Arc<dyn HttpCaller>,
}

impl NodeDispatcher {
    pub fn new(
        agents: Arc<dyn AgentRegistry>,
        notifier: Arc<dyn Notifier>,
        http: Arc<dyn HttpCaller>,
    ) -> Self {
        Self {
            agents,
            notifier,
            http,
        }
    }

    /// Dispatch one node. `inputs` maps predecessor node id to that node's
    /// output; the return value is this node's output.
    pub async fn dispatch(
        &self,
        node: &Node,
        inputs: &Map<String, Value>,
        ctx: &NodeContext,
    ) -> Result<Value, NodeError> {
        match node.kind {
            NodeKind::Trigger => Ok(self.handle_trigger(inputs, ctx)),
            NodeKind::Agent => self.handle_agent(node, inputs).await,
            NodeKind::Condition => self.handle_condition(node, inputs),
            NodeKind::Action => self.handle_action(node, inputs).await,
            NodeKind::Parallel => Ok(Value::Object(inputs.clone())),
            NodeKind::Delay => self.handle_delay(node, inputs, ctx).await,
        }
    }

    /// `trigger`: passes inputs through, or seeds the run's trigger data
    /// when the node has no predecessors.
    fn handle_trigger(&self, inputs: &Map<String, Value>, ctx: &NodeContext) -> Value {
        if inputs.is_empty() {
            ctx.trigger_data.clone()
        } else {
            Value::Object(inputs.clone())
        }
    }

    /// `agent`: resolve the agent and hand it the task plus predecessor
    /// outputs. A missing registry entry degrades to simulated output so
    /// pipelines stay runnable without LLM capacity.
    async fn handle_agent(
        &self,
        node: &Node,
        inputs: &Map<String, Value>,
    ) -> Result<Value, NodeError> {
        let agent_id = require_str(node, "agent_id")?;
        let task = require_str(node, "task")?;

        let Some(handle) = self.agents.get(agent_id) else {
            return Ok(json!({
                "result": format!("[simulated] {task}"),
                "agent_id": agent_id,
                "simulated": true,
            }));
        };

        let context = if inputs.is_empty() {
            task.to_owned()
        } else {
            let rendered = serde_json::to_string(inputs).unwrap_or_default();
            format!("{task}\n\nUpstream outputs:\n{rendered}")
        };

        let result = handle
            .process(&context)
            .await
            .map_err(|e| NodeError::Execution(format!("agent {agent_id}: {e:#}")))?;

        Ok(json!({"result": result, "agent_id": agent_id}))
    }

    /// `condition`: evaluate the restricted predicate.
    fn handle_condition(
        &self,
        node: &Node,
        inputs: &Map<String, Value>,
    ) -> Result<Value, NodeError> {
        let expr = require_str(node, "condition")?;
        let result = eval_condition(expr, inputs)?;
        Ok(json!({"result": result}))
    }

    /// `action`: delegate to one of the pipeline action sub-handlers.
    async fn handle_action(
        &self,
        node: &Node,
        inputs: &Map<String, Value>,
    ) -> Result<Value, NodeError> {
        let action_type = require_str(node, "action_type")?;

        match action_type {
            "notification" => {
                let channel = opt_str(node, "channel").unwrap_or("default");
                let recipients: Vec<String> = node
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
                let body = opt_str(node, "body")
                    .map(str::to_owned)
                    .unwrap_or_else(|| {
                        serde_json::to_string(inputs).unwrap_or_default()
                    });

                self.notifier
                    .send(channel, &recipients, &body)
                    .await
                    .map_err(|e| NodeError::Execution(format!("notification: {e:#}")))?;

                Ok(json!({"sent": true, "channel": channel}))
            }
            "call_api" => {
                let method = opt_str(node, "method").unwrap_or("GET");
                let url = node
                    .config
                    .get("url")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        NodeError::Config(format!(
                            "action node {:?} of type call_api requires a url",
                            node.id
                        ))
                    })?;
                let headers = node
                    .config
                    .get("headers")
                    .and_then(Value::as_object)
                    .map(|obj| {
                        obj.iter()
                            .filter_map(|(k, v)| {
                                v.as_str().map(|s| (k.clone(), s.to_owned()))
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                let body = node
                    .config
                    .get("body")
                    .map(|v| v.to_string());
                let timeout = node
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
                    .map_err(|e| NodeError::Execution(format!("call_api: {e:#}")))?;

                Ok(json!({"status": response.status, "body": response.body}))
            }
            // Running a pipeline from inside a pipeline would allow
            // stack-unbounded recursion through stored definitions.
            "execute_pipeline" => Err(NodeError::Config(
                "nested pipeline execution inside a pipeline action is not allowed".to_owned(),
            )),
            other => Err(NodeError::Config(format!(
                "unknown pipeline action type {other:?}"
            ))),
        }
    }

    /// `delay`: cooperative sleep that yields to cancellation.
    async fn handle_delay(
        &self,
        node: &Node,
        inputs: &Map<String, Value>,
        ctx: &NodeContext,
    ) -> Result<Value, NodeError> {
        let seconds = node
            .config
            .get("seconds")
            .and_then(Value::as_f64)
            .ok_or_else(|| {
                NodeError::Config(format!("delay node {:?} requires numeric seconds", node.id))
            })?;
        if seconds < 0.0 {
            return Err(NodeError::Config(format!(
                "delay node {:?} has negative seconds",
                node.id
            )));
        }

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs_f64(seconds)) => {
                Ok(Value::Object(inputs.clone()))
            }
            _ = ctx.cancel.cancelled() => Err(NodeError::Cancelled),
        }
    }
}

/// Evaluate the restricted condition grammar.
///
/// Accepted forms: literal `true` / `false`, or `input.<key>` where `<key>`
/// names a predecessor and its output is tested for truthiness. Anything
/// else is a configuration error -- conditions are data, not code.
pub fn eval_condition(expr: &str, inputs: &Map<String, Value>) -> Result<bool, NodeError> {
    let expr = expr.trim();
    match expr {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => {
            let key = expr.strip_prefix("input.").ok_or_else(|| {
                NodeError::Config(format!(
                    "unsupported condition {expr:?} (expected true, false, or input.<key>)"
                ))
            })?;
            if key.is_empty() || key.contains(|c: char| c.is_whitespace()) {
                return Err(NodeError::Config(format!(
                    "unsupported condition {expr:?} (expected true, false, or input.<key>)"
                )));
            }
            Ok(inputs.get(key).is_some_and(truthy))
        }
    }
}

/// Truthiness of a predecessor output.
fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => {
            // A condition node's own output shape {"result": ...} defers to
            // the inner result; any other object is truthy when non-empty.
            match o.get("result") {
                Some(inner) => truthy(inner),
                None => !o.is_empty(),
            }
        }
    }
}

fn require_str<'a>(node: &'a Node, key: &str) -> Result<&'a str, NodeError> {
    node.config
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| {
            NodeError::Config(format!(
                "{} node {:?} requires string config key {key:?}",
                node.kind, node.id
            ))
        })
}

fn opt_str<'a>(node: &'a Node, key: &str) -> Option<&'a str> {
    node.config.get(key).and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use anyhow::Result;
    use async_trait::async_trait;

    use crate::ports::{
        AgentHandle, HttpResponse, LogNotifier, NoHttpCaller, NullAgentRegistry,
    };

    use super::*;

    fn dispatcher() -> NodeDispatcher {
        NodeDispatcher::new(
            Arc::new(NullAgentRegistry),
            Arc::new(LogNotifier),
            Arc::new(NoHttpCaller),
        )
    }

    fn ctx() -> NodeContext {
        NodeContext {
            run_id: Uuid::new_v4(),
            trigger_data: json!({"x": 1}),
            cancel: CancellationToken::new(),
        }
    }

    fn make_node(id: &str, kind: NodeKind, config: Value) -> Node {
        Node {
            id: id.to_string(),
            kind,
            config: config.as_object().cloned().unwrap_or_default(),
        }
    }

    #[tokio::test]
    async fn trigger_without_predecessors_returns_trigger_data() {
        let d = dispatcher();
        let node = make_node("t", NodeKind::Trigger, json!({}));
        let out = d.dispatch(&node, &Map::new(), &ctx()).await.unwrap();
        assert_eq!(out, json!({"x": 1}));
    }

    #[tokio::test]
    async fn trigger_with_predecessors_passes_inputs_through() {
        let d = dispatcher();
        let node = make_node("t", NodeKind::Trigger, json!({}));
        let mut inputs = Map::new();
        inputs.insert("up".to_string(), json!({"done": true}));
        let out = d.dispatch(&node, &inputs, &ctx()).await.unwrap();
        assert_eq!(out, json!({"up": {"done": true}}));
    }

    #[tokio::test]
    async fn agent_without_registry_simulates() {
        let d = dispatcher();
        let node = make_node(
            "a",
            NodeKind::Agent,
            json!({"agent_id": "planner", "task": "plan the week"}),
        );
        let out = d.dispatch(&node, &Map::new(), &ctx()).await.unwrap();
        assert_eq!(out["agent_id"], "planner");
        assert_eq!(out["simulated"], true);
        assert!(out["result"].as_str().unwrap().contains("plan the week"));
    }

    #[tokio::test]
    async fn agent_with_registry_calls_handle() {
        struct EchoAgent;
        #[async_trait]
        impl AgentHandle for EchoAgent {
            async fn process(&self, context: &str) -> Result<String> {
                Ok(format!("echo: {context}"))
            }
        }
        struct OneAgentRegistry;
        impl AgentRegistry for OneAgentRegistry {
            fn get(&self, agent_id: &str) -> Option<Arc<dyn AgentHandle>> {
                (agent_id == "echo").then(|| Arc::new(EchoAgent) as Arc<dyn AgentHandle>)
            }
        }

        let d = NodeDispatcher::new(
            Arc::new(OneAgentRegistry),
            Arc::new(LogNotifier),
            Arc::new(NoHttpCaller),
        );
        let node = make_node(
            "a",
            NodeKind::Agent,
            json!({"agent_id": "echo", "task": "say hi"}),
        );
        let out = d.dispatch(&node, &Map::new(), &ctx()).await.unwrap();
        assert_eq!(out["result"], "echo: say hi");
        assert!(out.get("simulated").is_none());
    }

    #[tokio::test]
    async fn agent_missing_config_is_config_error() {
        let d = dispatcher();
        let node = make_node("a", NodeKind::Agent, json!({"agent_id": "x"}));
        let err = d.dispatch(&node, &Map::new(), &ctx()).await.unwrap_err();
        assert!(matches!(err, NodeError::Config(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn condition_literals() {
        let d = dispatcher();
        for (expr, expected) in [("true", true), ("false", false), ("  true ", true)] {
            let node = make_node("c", NodeKind::Condition, json!({"condition": expr}));
            let out = d.dispatch(&node, &Map::new(), &ctx()).await.unwrap();
            assert_eq!(out, json!({"result": expected}), "expr {expr:?}");
        }
    }

    #[tokio::test]
    async fn condition_input_reference() {
        let d = dispatcher();
        let node = make_node("c", NodeKind::Condition, json!({"condition": "input.up"}));

        let mut inputs = Map::new();
        inputs.insert("up".to_string(), json!({"result": true}));
        let out = d.dispatch(&node, &inputs, &ctx()).await.unwrap();
        assert_eq!(out, json!({"result": true}));

        inputs.insert("up".to_string(), json!({"result": false}));
        let out = d.dispatch(&node, &inputs, &ctx()).await.unwrap();
        assert_eq!(out, json!({"result": false}));

        // Missing predecessor output is falsy, not an error.
        let out = d.dispatch(&node, &Map::new(), &ctx()).await.unwrap();
        assert_eq!(out, json!({"result": false}));
    }

    #[tokio::test]
    async fn condition_rejects_arbitrary_expressions() {
        let d = dispatcher();
        for expr in ["1 == 1", "input.", "input.a or input.b", "__import__('os')"] {
            let node = make_node("c", NodeKind::Condition, json!({"condition": expr}));
            let err = d.dispatch(&node, &Map::new(), &ctx()).await.unwrap_err();
            assert!(matches!(err, NodeError::Config(_)), "expr {expr:?}");
        }
    }

    #[test]
    fn truthiness_rules() {
        assert!(!truthy(&Value::Null));
        assert!(truthy(&json!(true)));
        assert!(!truthy(&json!(false)));
        assert!(truthy(&json!(3)));
        assert!(!truthy(&json!(0)));
        assert!(truthy(&json!("x")));
        assert!(!truthy(&json!("")));
        assert!(truthy(&json!([1])));
        assert!(!truthy(&json!([])));
        assert!(truthy(&json!({"a": 1})));
        assert!(!truthy(&json!({})));
        assert!(!truthy(&json!({"result": false})));
        assert!(truthy(&json!({"result": "ok"})));
    }

    #[tokio::test]
    async fn action_notification_sends() {
        let d = dispatcher();
        let node = make_node(
            "n",
            NodeKind::Action,
            json!({
                "action_type": "notification",
                "channel": "alerts",
                "recipients": ["ops"],
                "body": "done",
            }),
        );
        let out = d.dispatch(&node, &Map::new(), &ctx()).await.unwrap();
        assert_eq!(out, json!({"sent": true, "channel": "alerts"}));
    }

    #[tokio::test]
    async fn action_call_api_wraps_transport_failure() {
        let d = dispatcher();
        let node = make_node(
            "api",
            NodeKind::Action,
            json!({"action_type": "call_api", "url": "https://example.test"}),
        );
        let err = d.dispatch(&node, &Map::new(), &ctx()).await.unwrap_err();
        assert!(matches!(err, NodeError::Execution(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn action_call_api_reports_response() {
        struct FixedHttp;
        #[async_trait]
        impl HttpCaller for FixedHttp {
            async fn call(
                &self,
                _method: &str,
                _url: &str,
                _headers: &HashMap<String, String>,
                _body: Option<&str>,
                _timeout: Duration,
            ) -> Result<HttpResponse> {
                Ok(HttpResponse {
                    status: 201,
                    headers: HashMap::new(),
                    body: "created".to_string(),
                })
            }
        }

        let d = NodeDispatcher::new(
            Arc::new(NullAgentRegistry),
            Arc::new(LogNotifier),
            Arc::new(FixedHttp),
        );
        let node = make_node(
            "api",
            NodeKind::Action,
            json!({"action_type": "call_api", "method": "POST", "url": "https://example.test"}),
        );
        let out = d.dispatch(&node, &Map::new(), &ctx()).await.unwrap();
        assert_eq!(out, json!({"status": 201, "body": "created"}));
    }

    #[tokio::test]
    async fn action_rejects_nested_pipeline() {
        let d = dispatcher();
        let node = make_node(
            "nested",
            NodeKind::Action,
            json!({"action_type": "execute_pipeline", "pipeline_id": "whatever"}),
        );
        let err = d.dispatch(&node, &Map::new(), &ctx()).await.unwrap_err();
        assert!(matches!(err, NodeError::Config(_)));
    }

    #[tokio::test]
    async fn parallel_passes_inputs_through() {
        let d = dispatcher();
        let node = make_node("p", NodeKind::Parallel, json!({}));
        let mut inputs = Map::new();
        inputs.insert("a".to_string(), json!({"v": 1}));
        let out = d.dispatch(&node, &inputs, &ctx()).await.unwrap();
        assert_eq!(out, json!({"a": {"v": 1}}));
    }

    #[tokio::test]
    async fn delay_sleeps_then_passes_through() {
        let d = dispatcher();
        let node = make_node("d", NodeKind::Delay, json!({"seconds": 0.01}));
        let out = d.dispatch(&node, &Map::new(), &ctx()).await.unwrap();
        assert_eq!(out, json!({}));
    }

    #[tokio::test]
    async fn delay_observes_cancellation() {
        let d = dispatcher();
        let node = make_node("d", NodeKind::Delay, json!({"seconds": 30}));
        let context = ctx();
        context.cancel.cancel();
        let err = d.dispatch(&node, &Map::new(), &context).await.unwrap_err();
        assert!(matches!(err, NodeError::Cancelled));
    }
}
