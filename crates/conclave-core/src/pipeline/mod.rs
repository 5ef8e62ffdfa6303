//! Pipeline definitions: typed DAG entities parsed from the persisted JSON
//! shape, plus the executor and run manager that drive them.

pub mod executor;
pub mod manager;
pub mod node;
pub mod validate;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use self::validate::ValidationError;

/// Kind of a pipeline node -- selects the dispatch handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Trigger,
    Agent,
    Condition,
    Action,
    Parallel,
    Delay,
}

impl NodeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trigger => "trigger",
            Self::Agent => "agent",
            Self::Condition => "condition",
            Self::Action => "action",
            Self::Parallel => "parallel",
            Self::Delay => "delay",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeKind {
    type Err = NodeKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trigger" => Ok(Self::Trigger),
            "agent" => Ok(Self::Agent),
            "condition" => Ok(Self::Condition),
            "action" => Ok(Self::Action),
            "parallel" => Ok(Self::Parallel),
            "delay" => Ok(Self::Delay),
            other => Err(NodeKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`NodeKind`] string.
#[derive(Debug, Clone)]
pub struct NodeKindParseError(pub String);

impl fmt::Display for NodeKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid node kind: {:?}", self.0)
    }
}

impl std::error::Error for NodeKindParseError {}

/// A vertex of the pipeline DAG with its kind-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub kind: NodeKind,
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
}

/// A directed dependency between two nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    pub from: String,
    pub to: String,
    /// Reserved; edge conditions are not evaluated by this core.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

/// A validated pipeline definition, immutable for the duration of a run.
#[derive(Debug, Clone)]
pub struct PipelineDefinition {
    pub id: Uuid,
    pub name: String,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub timeout: Duration,
    pub max_retries_per_node: u32,
    pub retry_backoff_base: Duration,
    pub retry_backoff_max: Duration,
}

/// Error returned when a persisted definition cannot be turned into a
/// [`PipelineDefinition`].
#[derive(Debug, Error)]
pub enum PipelineParseError {
    #[error("definition is not a valid pipeline document: {0}")]
    Shape(#[from] serde_json::Error),

    #[error("definition failed validation: {}", format_errors(.0))]
    Invalid(Vec<ValidationError>),
}

fn format_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl PipelineDefinition {
    /// Parse the mapping-shaped definition stored in a
    /// [`conclave_db::models::Pipeline`] row, rejecting on any validation
    /// error.
    pub fn parse(row: &conclave_db::models::Pipeline) -> Result<Self, PipelineParseError> {
        let raw: validate::RawDefinition = serde_json::from_value(row.definition.clone())?;

        let errors = validate::validate(&raw);
        if !errors.is_empty() {
            return Err(PipelineParseError::Invalid(errors));
        }

        let nodes = raw
            .nodes
            .into_iter()
            .map(|n| Node {
                // Unknown kinds were already rejected by validate().
                kind: n.kind.parse().unwrap_or(NodeKind::Trigger),
                id: n.id,
                config: n.config,
            })
            .collect();

        Ok(Self {
            id: row.id,
            name: row.name.clone(),
            nodes,
            edges: raw.edges,
            timeout: Duration::from_secs(row.timeout_s.max(1) as u64),
            max_retries_per_node: row.max_retries_per_node.max(0) as u32,
            retry_backoff_base: Duration::from_millis(row.retry_backoff_base_ms.max(1) as u64),
            retry_backoff_max: Duration::from_millis(row.retry_backoff_max_ms.max(1) as u64),
        })
    }

    /// Map from node id to the set of its direct predecessors.
    pub fn predecessors(&self) -> HashMap<&str, BTreeSet<&str>> {
        validate::predecessors(&self.nodes, &self.edges)
    }

    /// Map from node id to the set of its direct successors.
    pub fn successors(&self) -> HashMap<&str, BTreeSet<&str>> {
        validate::successors(&self.nodes, &self.edges)
    }

    /// A linear extension of the precedence relation (the static pass).
    ///
    /// Deterministic: ties are broken by node-id ordering. Fails only if the
    /// graph contains a cycle, which `parse` rules out; a hand-built
    /// definition can still hit the error path.
    pub fn topological_order(&self) -> Result<Vec<String>, ValidationError> {
        validate::topological_order(&self.nodes, &self.edges)
    }

    /// Batches of nodes whose predecessors are all in earlier batches (the
    /// iterative pass, reserved for parallel execution).
    pub fn topological_batches(&self) -> Result<Vec<Vec<String>>, ValidationError> {
        validate::topological_batches(&self.nodes, &self.edges)
    }

    /// Look up a node by id.
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }
}
