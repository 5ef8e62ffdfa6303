use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl RunStatus {
    /// Terminal states are write-once: once a run reaches one of these it
    /// never transitions again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Timeout
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

impl FromStr for RunStatus {
    type Err = RunStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "timeout" => Ok(Self::Timeout),
            other => Err(RunStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`RunStatus`] string.
#[derive(Debug, Clone)]
pub struct RunStatusParseError(pub String);

impl fmt::Display for RunStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid run status: {:?}", self.0)
    }
}

impl std::error::Error for RunStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a single node's attempt-series within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NodeRunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl fmt::Display for NodeRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for NodeRunStatus {
    type Err = NodeRunStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(NodeRunStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`NodeRunStatus`] string.
#[derive(Debug, Clone)]
pub struct NodeRunStatusParseError(pub String);

impl fmt::Display for NodeRunStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid node run status: {:?}", self.0)
    }
}

impl std::error::Error for NodeRunStatusParseError {}

// ---------------------------------------------------------------------------

/// Kind of a scheduled action -- selects the dispatcher handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    RunTask,
    ExecutePipeline,
    SendNotification,
    CallApi,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::RunTask => "run_task",
            Self::ExecutePipeline => "execute_pipeline",
            Self::SendNotification => "send_notification",
            Self::CallApi => "call_api",
        };
        f.write_str(s)
    }
}

impl FromStr for ActionKind {
    type Err = ActionKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "run_task" => Ok(Self::RunTask),
            "execute_pipeline" => Ok(Self::ExecutePipeline),
            "send_notification" => Ok(Self::SendNotification),
            "call_api" => Ok(Self::CallApi),
            other => Err(ActionKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ActionKind`] string.
#[derive(Debug, Clone)]
pub struct ActionKindParseError(pub String);

impl fmt::Display for ActionKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid action kind: {:?}", self.0)
    }
}

impl std::error::Error for ActionKindParseError {}

// ---------------------------------------------------------------------------

/// How a scheduled action decides its next firing time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    Cron,
    Interval,
    Once,
    Event,
}

impl fmt::Display for ScheduleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Cron => "cron",
            Self::Interval => "interval",
            Self::Once => "once",
            Self::Event => "event",
        };
        f.write_str(s)
    }
}

impl FromStr for ScheduleKind {
    type Err = ScheduleKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cron" => Ok(Self::Cron),
            "interval" => Ok(Self::Interval),
            "once" => Ok(Self::Once),
            "event" => Ok(Self::Event),
            other => Err(ScheduleKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ScheduleKind`] string.
#[derive(Debug, Clone)]
pub struct ScheduleKindParseError(pub String);

impl fmt::Display for ScheduleKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid schedule kind: {:?}", self.0)
    }
}

impl std::error::Error for ScheduleKindParseError {}

// ---------------------------------------------------------------------------

/// Lifecycle status of a scheduled action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Active,
    Paused,
    Disabled,
    Expired,
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Disabled => "disabled",
            Self::Expired => "expired",
        };
        f.write_str(s)
    }
}

impl FromStr for ActionStatus {
    type Err = ActionStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "disabled" => Ok(Self::Disabled),
            "expired" => Ok(Self::Expired),
            other => Err(ActionStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ActionStatus`] string.
#[derive(Debug, Clone)]
pub struct ActionStatusParseError(pub String);

impl fmt::Display for ActionStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid action status: {:?}", self.0)
    }
}

impl std::error::Error for ActionStatusParseError {}

// ---------------------------------------------------------------------------

/// What caused a scheduled-action run to be dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TriggeredBy {
    Scheduler,
    Recovery,
    Manual,
}

impl fmt::Display for TriggeredBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Scheduler => "scheduler",
            Self::Recovery => "recovery",
            Self::Manual => "manual",
        };
        f.write_str(s)
    }
}

impl FromStr for TriggeredBy {
    type Err = TriggeredByParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduler" => Ok(Self::Scheduler),
            "recovery" => Ok(Self::Recovery),
            "manual" => Ok(Self::Manual),
            other => Err(TriggeredByParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TriggeredBy`] string.
#[derive(Debug, Clone)]
pub struct TriggeredByParseError(pub String);

impl fmt::Display for TriggeredByParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid triggered_by: {:?}", self.0)
    }
}

impl std::error::Error for TriggeredByParseError {}

// ---------------------------------------------------------------------------

/// Status of a single dispatch attempt for a scheduled action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ActionRunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
}

impl fmt::Display for ActionRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

impl FromStr for ActionRunStatus {
    type Err = ActionRunStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::Timeout),
            other => Err(ActionRunStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ActionRunStatus`] string.
#[derive(Debug, Clone)]
pub struct ActionRunStatusParseError(pub String);

impl fmt::Display for ActionRunStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid action run status: {:?}", self.0)
    }
}

impl std::error::Error for ActionRunStatusParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A stored pipeline definition with its execution policy.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Pipeline {
    pub id: Uuid,
    pub name: String,
    pub definition: serde_json::Value,
    pub timeout_s: i64,
    pub max_retries_per_node: i32,
    pub retry_backoff_base_ms: i64,
    pub retry_backoff_max_ms: i64,
    pub created_at: DateTime<Utc>,
}

/// One execution instance of a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PipelineRun {
    pub id: Uuid,
    pub pipeline_id: Uuid,
    pub status: RunStatus,
    pub trigger_data: serde_json::Value,
    pub current_node: Option<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

/// The attempt-series for one node in one run.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PipelineNodeRun {
    pub id: i64,
    pub run_id: Uuid,
    pub node_id: String,
    pub kind: String,
    pub status: NodeRunStatus,
    pub input_summary: Option<serde_json::Value>,
    pub output_summary: Option<serde_json::Value>,
    pub error: Option<String>,
    pub retry_count: i32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

/// A recurring or one-shot scheduled trigger.
///
/// The `id` is a plain 32-bit integer because it doubles as the advisory-lock
/// resource key (see [`crate::advisory`]).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ScheduledAction {
    pub id: i32,
    pub agent_id: String,
    pub kind: ActionKind,
    pub config: serde_json::Value,
    pub schedule_kind: ScheduleKind,
    pub cron_expression: Option<String>,
    pub interval_s: Option<i64>,
    pub run_at: Option<DateTime<Utc>>,
    pub event_name: Option<String>,
    pub status: ActionStatus,
    pub next_run_at: Option<DateTime<Utc>>,
    pub timeout_s: i64,
    pub max_retries: i32,
    pub retry_delay_s: i64,
    pub allow_concurrent: bool,
    pub execution_count: i64,
    pub last_run_status: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One dispatch attempt for a scheduled action.
///
/// The `(action_id, triggered_at)` pair identifies a dispatch window; the
/// scheduler's crash-recovery deduplication queries depend on it.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ScheduledActionRun {
    pub id: i64,
    pub action_id: i32,
    pub triggered_at: DateTime<Utc>,
    pub triggered_by: TriggeredBy,
    pub status: ActionRunStatus,
    pub error: Option<String>,
    pub retry_count: i32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
