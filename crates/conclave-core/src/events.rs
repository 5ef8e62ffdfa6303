//! Observability events emitted at run and node lifecycle boundaries.
//!
//! Emission is fire-and-forget with at-most-once semantics: the core never
//! blocks on a sink, and a sink failure is logged at `warn` and swallowed
//! so it cannot affect a run's outcome.

use std::sync::Mutex;

use serde_json::json;
use tracing::warn;
use uuid::Uuid;

/// One of the ten lifecycle events.
#[derive(Debug, Clone)]
pub enum OrchestrationEvent {
    RunStarted { run_id: Uuid, pipeline_id: Uuid },
    RunCompleted { run_id: Uuid },
    RunFailed { run_id: Uuid, error: String },
    RunCancelled { run_id: Uuid },
    RunTimeout { run_id: Uuid },
    NodeStarted { run_id: Uuid, node_id: String },
    NodeCompleted { run_id: Uuid, node_id: String },
    NodeFailed { run_id: Uuid, node_id: String, error: String },
    NodeSkipped { run_id: Uuid, node_id: String },
    NodeRetrying { run_id: Uuid, node_id: String, retry: u32 },
}

impl OrchestrationEvent {
    /// The wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "pipeline_run_started",
            Self::RunCompleted { .. } => "pipeline_run_completed",
            Self::RunFailed { .. } => "pipeline_run_failed",
            Self::RunCancelled { .. } => "pipeline_run_cancelled",
            Self::RunTimeout { .. } => "pipeline_run_timeout",
            Self::NodeStarted { .. } => "pipeline_node_started",
            Self::NodeCompleted { .. } => "pipeline_node_completed",
            Self::NodeFailed { .. } => "pipeline_node_failed",
            Self::NodeSkipped { .. } => "pipeline_node_skipped",
            Self::NodeRetrying { .. } => "pipeline_node_retrying",
        }
    }

    /// A JSON payload for sinks that forward events off-process.
    pub fn payload(&self) -> serde_json::Value {
        match self {
            Self::RunStarted { run_id, pipeline_id } => {
                json!({"run_id": run_id, "pipeline_id": pipeline_id})
            }
            Self::RunCompleted { run_id }
            | Self::RunCancelled { run_id }
            | Self::RunTimeout { run_id } => json!({"run_id": run_id}),
            Self::RunFailed { run_id, error } => json!({"run_id": run_id, "error": error}),
            Self::NodeStarted { run_id, node_id }
            | Self::NodeCompleted { run_id, node_id }
            | Self::NodeSkipped { run_id, node_id } => {
                json!({"run_id": run_id, "node_id": node_id})
            }
            Self::NodeFailed {
                run_id,
                node_id,
                error,
            } => json!({"run_id": run_id, "node_id": node_id, "error": error}),
            Self::NodeRetrying {
                run_id,
                node_id,
                retry,
            } => json!({"run_id": run_id, "node_id": node_id, "retry": retry}),
        }
    }
}

/// Port for delivering lifecycle events to an external consumer.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &OrchestrationEvent) -> anyhow::Result<()>;
}

/// Emit an event, swallowing and logging any sink failure.
pub fn emit(sink: &dyn EventSink, event: OrchestrationEvent) {
    if let Err(e) = sink.emit(&event) {
        warn!(event = event.name(), error = %e, "event emission failed (swallowed)");
    }
}

/// Default sink: structured log lines.
#[derive(Debug, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: &OrchestrationEvent) -> anyhow::Result<()> {
        tracing::info!(event = event.name(), payload = %event.payload(), "orchestration event");
        Ok(())
    }
}

/// Sink that records events in memory. Used by tests to assert ordering.
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<(String, serde_json::Value)>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of `(name, payload)` pairs in emission order.
    pub fn recorded(&self) -> Vec<(String, serde_json::Value)> {
        self.events.lock().expect("recording sink poisoned").clone()
    }

    /// Names only, in emission order.
    pub fn names(&self) -> Vec<String> {
        self.recorded().into_iter().map(|(name, _)| name).collect()
    }
}

impl EventSink for RecordingEventSink {
    fn emit(&self, event: &OrchestrationEvent) -> anyhow::Result<()> {
        self.events
            .lock()
            .expect("recording sink poisoned")
            .push((event.name().to_string(), event.payload()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_names_match_wire_contract() {
        let run_id = Uuid::nil();
        let cases: Vec<(OrchestrationEvent, &str)> = vec![
            (
                OrchestrationEvent::RunStarted {
                    run_id,
                    pipeline_id: Uuid::nil(),
                },
                "pipeline_run_started",
            ),
            (
                OrchestrationEvent::RunCompleted { run_id },
                "pipeline_run_completed",
            ),
            (
                OrchestrationEvent::RunFailed {
                    run_id,
                    error: "boom".into(),
                },
                "pipeline_run_failed",
            ),
            (
                OrchestrationEvent::RunCancelled { run_id },
                "pipeline_run_cancelled",
            ),
            (
                OrchestrationEvent::RunTimeout { run_id },
                "pipeline_run_timeout",
            ),
            (
                OrchestrationEvent::NodeStarted {
                    run_id,
                    node_id: "n".into(),
                },
                "pipeline_node_started",
            ),
            (
                OrchestrationEvent::NodeCompleted {
                    run_id,
                    node_id: "n".into(),
                },
                "pipeline_node_completed",
            ),
            (
                OrchestrationEvent::NodeFailed {
                    run_id,
                    node_id: "n".into(),
                    error: "boom".into(),
                },
                "pipeline_node_failed",
            ),
            (
                OrchestrationEvent::NodeSkipped {
                    run_id,
                    node_id: "n".into(),
                },
                "pipeline_node_skipped",
            ),
            (
                OrchestrationEvent::NodeRetrying {
                    run_id,
                    node_id: "n".into(),
                    retry: 1,
                },
                "pipeline_node_retrying",
            ),
        ];
        for (event, expected) in &cases {
            assert_eq!(event.name(), *expected);
        }
    }

    #[test]
    fn emit_swallows_sink_errors() {
        struct FailingSink;
        impl EventSink for FailingSink {
            fn emit(&self, _event: &OrchestrationEvent) -> anyhow::Result<()> {
                anyhow::bail!("sink unreachable")
            }
        }

        // Must not panic or propagate.
        emit(
            &FailingSink,
            OrchestrationEvent::RunCompleted { run_id: Uuid::nil() },
        );
    }

    #[test]
    fn recording_sink_preserves_order() {
        let sink = RecordingEventSink::new();
        emit(
            &sink,
            OrchestrationEvent::NodeStarted {
                run_id: Uuid::nil(),
                node_id: "a".into(),
            },
        );
        emit(
            &sink,
            OrchestrationEvent::NodeCompleted {
                run_id: Uuid::nil(),
                node_id: "a".into(),
            },
        );
        assert_eq!(
            sink.names(),
            vec!["pipeline_node_started", "pipeline_node_completed"]
        );
    }
}
