//! Execution tracking types.
//!
//! An `ExecutionRecord` is one run of a workflow template for one tenant.
//! It is created RUNNING and moves to exactly one terminal status. History
//! is kept separately as an append-only list of `ExecutionEvent`s.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Aborted,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Succeeded => "SUCCEEDED",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::TimedOut => "TIMED_OUT",
            ExecutionStatus::Aborted => "ABORTED",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "RUNNING" => Ok(ExecutionStatus::Running),
            "SUCCEEDED" => Ok(ExecutionStatus::Succeeded),
            "FAILED" => Ok(ExecutionStatus::Failed),
            "TIMED_OUT" => Ok(ExecutionStatus::TimedOut),
            "ABORTED" => Ok(ExecutionStatus::Aborted),
            other => Err(format!("invalid execution status: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Execution record
// ---------------------------------------------------------------------------

/// One run of a workflow.
///
/// Records are replaced whole on every update; readers never observe a
/// partially-applied change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub execution_id: Uuid,
    pub workflow_type: String,
    pub tenant_id: String,
    pub correlation_id: String,
    pub status: ExecutionStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_time: Option<DateTime<Utc>>,
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl ExecutionRecord {
    /// Wall-clock duration for records with both timestamps.
    pub fn duration_ms(&self) -> Option<i64> {
        self.stop_time
            .map(|stop| (stop - self.start_time).num_milliseconds())
    }

    /// Copy of this record moved to a terminal status.
    pub fn finished(
        &self,
        status: ExecutionStatus,
        output: Option<Value>,
        error: Option<String>,
        cause: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            status,
            stop_time: Some(now.max(self.start_time)),
            output,
            error,
            cause,
            ..self.clone()
        }
    }
}

/// Response body for a start request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionHandle {
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
    pub start_time: DateTime<Utc>,
}

impl From<&ExecutionRecord> for ExecutionHandle {
    fn from(record: &ExecutionRecord) -> Self {
        Self {
            execution_id: record.execution_id,
            status: record.status,
            start_time: record.start_time,
        }
    }
}

/// Request to start a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartWorkflowRequest {
    pub workflow_type: String,
    pub tenant_id: String,
    #[serde(default = "empty_object")]
    pub parameters: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Result of a stop request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopOutcome {
    pub stopped: bool,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Filtering
// ---------------------------------------------------------------------------

/// Optional filters for listing executions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ExecutionStatus>,
}

impl ExecutionFilter {
    pub fn for_tenant(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: Some(tenant_id.into()),
            ..Default::default()
        }
    }

    pub fn matches(&self, record: &ExecutionRecord) -> bool {
        self.tenant_id
            .as_deref()
            .is_none_or(|t| record.tenant_id == t)
            && self
                .workflow_type
                .as_deref()
                .is_none_or(|w| record.workflow_type == w)
            && self.status.is_none_or(|s| record.status == s)
    }
}

// ---------------------------------------------------------------------------
// History events
// ---------------------------------------------------------------------------

/// Kind of an execution history event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionEventKind {
    StateEntered,
    StateExited,
    TaskRetry,
    ErrorCaught,
    ExecutionSucceeded,
    ExecutionFailed,
    ExecutionTimedOut,
    ExecutionAborted,
}

impl ExecutionEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionEventKind::StateEntered => "STATE_ENTERED",
            ExecutionEventKind::StateExited => "STATE_EXITED",
            ExecutionEventKind::TaskRetry => "TASK_RETRY",
            ExecutionEventKind::ErrorCaught => "ERROR_CAUGHT",
            ExecutionEventKind::ExecutionSucceeded => "EXECUTION_SUCCEEDED",
            ExecutionEventKind::ExecutionFailed => "EXECUTION_FAILED",
            ExecutionEventKind::ExecutionTimedOut => "EXECUTION_TIMED_OUT",
            ExecutionEventKind::ExecutionAborted => "EXECUTION_ABORTED",
        }
    }

    /// The terminal event matching a terminal status.
    pub fn for_status(status: ExecutionStatus) -> Option<Self> {
        match status {
            ExecutionStatus::Running => None,
            ExecutionStatus::Succeeded => Some(ExecutionEventKind::ExecutionSucceeded),
            ExecutionStatus::Failed => Some(ExecutionEventKind::ExecutionFailed),
            ExecutionStatus::TimedOut => Some(ExecutionEventKind::ExecutionTimedOut),
            ExecutionStatus::Aborted => Some(ExecutionEventKind::ExecutionAborted),
        }
    }
}

impl FromStr for ExecutionEventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(Value::String(s.to_string()))
            .map_err(|_| format!("invalid event kind: '{s}'"))
    }
}

/// One entry in an execution's transition history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionEvent {
    pub execution_id: Uuid,
    /// Monotonic per execution, starting at 1.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: ExecutionEventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_name: Option<String>,
    /// Nesting path for branch/iteration/sub-workflow states; empty at top level.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub scope: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Aggregate counts over a set of executions. Derived, never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowMetricsSnapshot {
    pub total_executions: u64,
    pub running: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub aborted: u64,
    pub average_execution_time_millis: u64,
}
