//! DAG validation and topological ordering.
//!
//! Validates a raw, mapping-shaped definition before it becomes a typed
//! [`super::PipelineDefinition`]:
//! - node set is non-empty, ids are unique;
//! - every kind names a known handler and carries its required config;
//! - edge endpoints reference existing nodes;
//! - the graph is acyclic (reported with the nodes on the cycle).
//!
//! Orphan nodes (no edges at all) are warned about but accepted: a
//! standalone `trigger` node is legitimate.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};

use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use super::{Edge, Node, NodeKind};

/// The persisted definition shape, before kind typing.
///
/// `from` / `to` are accepted as plain keys on edges.
#[derive(Debug, Clone, Deserialize)]
pub struct RawDefinition {
    #[serde(default)]
    pub nodes: Vec<RawNode>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

/// A node as persisted: the kind is an untrusted string.
#[derive(Debug, Clone, Deserialize)]
pub struct RawNode {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
}

/// Errors reported by [`validate`].
#[derive(Debug, Clone, Error)]
pub enum ValidationError {
    #[error("pipeline must contain at least one node")]
    EmptyNodeSet,

    #[error("duplicate node id: {0:?}")]
    DuplicateNodeId(String),

    #[error("node {node:?} has unknown kind {kind:?}")]
    UnknownNodeKind { node: String, kind: String },

    #[error("node {node:?} ({kind}) is missing required config key {key:?}")]
    MissingConfig {
        node: String,
        kind: NodeKind,
        key: &'static str,
    },

    #[error("node {node:?} has invalid config: {detail}")]
    InvalidConfig { node: String, detail: String },

    #[error("edge {edge:?} references unknown node {endpoint:?}")]
    UnknownEdgeEndpoint { edge: String, endpoint: String },

    #[error("dependency cycle detected involving nodes: {0}")]
    CycleDetected(String),
}

/// Validate a raw definition, returning every error found (not just the
/// first).
pub fn validate(raw: &RawDefinition) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if raw.nodes.is_empty() {
        errors.push(ValidationError::EmptyNodeSet);
        return errors;
    }

    // Unique ids.
    let mut seen: HashSet<&str> = HashSet::new();
    for node in &raw.nodes {
        if !seen.insert(&node.id) {
            errors.push(ValidationError::DuplicateNodeId(node.id.clone()));
        }
    }

    // Kind and kind-specific config.
    for node in &raw.nodes {
        match node.kind.parse::<NodeKind>() {
            Err(_) => errors.push(ValidationError::UnknownNodeKind {
                node: node.id.clone(),
                kind: node.kind.clone(),
            }),
            Ok(kind) => errors.extend(check_config(&node.id, kind, &node.config)),
        }
    }

    // Edge endpoints.
    for edge in &raw.edges {
        for endpoint in [&edge.from, &edge.to] {
            if !seen.contains(endpoint.as_str()) {
                errors.push(ValidationError::UnknownEdgeEndpoint {
                    edge: edge.id.clone(),
                    endpoint: endpoint.clone(),
                });
            }
        }
    }

    // Cycle detection only makes sense on a structurally sound graph.
    if errors.is_empty() {
        let mut connected: HashSet<&str> = HashSet::new();
        for edge in &raw.edges {
            connected.insert(&edge.from);
            connected.insert(&edge.to);
        }
        for node in &raw.nodes {
            if !connected.contains(node.id.as_str()) && raw.nodes.len() > 1 {
                warn!(node = %node.id, "orphan node has no edges (accepted)");
            }
        }

        if let Err(cycle) = kahn_order(
            raw.nodes.iter().map(|n| n.id.as_str()),
            raw.edges.iter().map(|e| (e.from.as_str(), e.to.as_str())),
        ) {
            errors.push(cycle);
        }
    }

    errors
}

/// Required config keys per node kind.
///
/// `trigger` and `parallel` accept any config. Deeper shape problems (for
/// example a condition expression outside the accepted grammar) surface at
/// dispatch as configuration errors.
fn check_config(
    node_id: &str,
    kind: NodeKind,
    config: &serde_json::Map<String, serde_json::Value>,
) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    let mut require = |key: &'static str| {
        if !config.contains_key(key) {
            errors.push(ValidationError::MissingConfig {
                node: node_id.to_owned(),
                kind,
                key,
            });
        }
    };

    match kind {
        NodeKind::Agent => {
            require("agent_id");
            require("task");
        }
        NodeKind::Condition => require("condition"),
        NodeKind::Action => require("action_type"),
        NodeKind::Delay => {
            match config.get("seconds").and_then(serde_json::Value::as_f64) {
                Some(secs) if secs >= 0.0 => {}
                Some(_) => errors.push(ValidationError::InvalidConfig {
                    node: node_id.to_owned(),
                    detail: "delay seconds must be non-negative".to_owned(),
                }),
                None => errors.push(ValidationError::MissingConfig {
                    node: node_id.to_owned(),
                    kind,
                    key: "seconds",
                }),
            }
        }
        NodeKind::Trigger | NodeKind::Parallel => {}
    }

    errors
}

/// Map from node id to the set of its direct predecessors.
pub fn predecessors<'a>(nodes: &'a [Node], edges: &'a [Edge]) -> HashMap<&'a str, BTreeSet<&'a str>> {
    let mut map: HashMap<&str, BTreeSet<&str>> =
        nodes.iter().map(|n| (n.id.as_str(), BTreeSet::new())).collect();
    for edge in edges {
        if let Some(preds) = map.get_mut(edge.to.as_str()) {
            preds.insert(edge.from.as_str());
        }
    }
    map
}

/// Map from node id to the set of its direct successors.
pub fn successors<'a>(nodes: &'a [Node], edges: &'a [Edge]) -> HashMap<&'a str, BTreeSet<&'a str>> {
    let mut map: HashMap<&str, BTreeSet<&str>> =
        nodes.iter().map(|n| (n.id.as_str(), BTreeSet::new())).collect();
    for edge in edges {
        if let Some(succs) = map.get_mut(edge.from.as_str()) {
            succs.insert(edge.to.as_str());
        }
    }
    map
}

/// The static pass: all node ids in one linear extension of the precedence
/// relation, ties broken by node-id ordering.
pub fn topological_order(nodes: &[Node], edges: &[Edge]) -> Result<Vec<String>, ValidationError> {
    kahn_order(
        nodes.iter().map(|n| n.id.as_str()),
        edges.iter().map(|e| (e.from.as_str(), e.to.as_str())),
    )
}

/// The iterative pass: waves of nodes whose predecessors all sit in earlier
/// waves. Reserved for parallel execution; the default executor consumes
/// [`topological_order`] instead.
pub fn topological_batches(
    nodes: &[Node],
    edges: &[Edge],
) -> Result<Vec<Vec<String>>, ValidationError> {
    let mut in_degree: HashMap<&str, usize> =
        nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
    let mut adj: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in edges {
        adj.entry(edge.from.as_str()).or_default().push(edge.to.as_str());
        if let Some(deg) = in_degree.get_mut(edge.to.as_str()) {
            *deg += 1;
        }
    }

    let mut ready: Vec<&str> = in_degree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(id, _)| *id)
        .collect();
    ready.sort_unstable();

    let mut batches = Vec::new();
    let mut emitted = 0usize;

    while !ready.is_empty() {
        emitted += ready.len();
        let mut next: Vec<&str> = Vec::new();
        for id in &ready {
            for succ in adj.get(id).into_iter().flatten() {
                if let Some(deg) = in_degree.get_mut(succ) {
                    *deg -= 1;
                    if *deg == 0 {
                        next.push(succ);
                    }
                }
            }
        }
        next.sort_unstable();
        batches.push(ready.iter().map(|s| s.to_string()).collect());
        ready = next;
    }

    if emitted != nodes.len() {
        return Err(cycle_error(&in_degree));
    }

    Ok(batches)
}

/// Kahn's algorithm with a min-heap so equal-rank nodes peel in id order.
fn kahn_order<'a>(
    node_ids: impl Iterator<Item = &'a str>,
    edge_pairs: impl Iterator<Item = (&'a str, &'a str)>,
) -> Result<Vec<String>, ValidationError> {
    let ids: Vec<&str> = node_ids.collect();
    let mut in_degree: HashMap<&str, usize> = ids.iter().map(|id| (*id, 0)).collect();
    let mut adj: HashMap<&str, Vec<&str>> = HashMap::new();

    for (from, to) in edge_pairs {
        adj.entry(from).or_default().push(to);
        if let Some(deg) = in_degree.get_mut(to) {
            *deg += 1;
        }
    }

    let mut heap: BinaryHeap<Reverse<&str>> = in_degree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(id, _)| Reverse(*id))
        .collect();

    let mut order = Vec::with_capacity(ids.len());
    while let Some(Reverse(id)) = heap.pop() {
        order.push(id.to_string());
        for succ in adj.get(id).into_iter().flatten() {
            if let Some(deg) = in_degree.get_mut(succ) {
                *deg -= 1;
                if *deg == 0 {
                    heap.push(Reverse(*succ));
                }
            }
        }
    }

    if order.len() != ids.len() {
        return Err(cycle_error(&in_degree));
    }

    Ok(order)
}

/// Name the nodes still holding positive in-degree after the peel: they sit
/// on (or downstream of) a cycle.
fn cycle_error(in_degree: &HashMap<&str, usize>) -> ValidationError {
    let mut stuck: Vec<&str> = in_degree
        .iter()
        .filter(|(_, deg)| **deg > 0)
        .map(|(id, _)| *id)
        .collect();
    stuck.sort_unstable();
    ValidationError::CycleDetected(stuck.join(", "))
}
