//! Request/response shapes exchanged with the remote coordinator.
//!
//! These mirror the coordinator's RPC surface field for field. The transport
//! that carries them is not part of this crate; anything that can move these
//! structs (gRPC, HTTP+JSON, an in-process channel) can back a coordinator.

use std::fmt;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::task::TaskAssignment;

// ---------------------------------------------------------------------------
// Compatibility classification
// ---------------------------------------------------------------------------

/// Coordinator verdict on how a newly registered version relates to the
/// previously registered one. Informational for workers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Compatibility {
    /// First version of this workflow id.
    New,
    /// Only additive changes; in-flight executions are unaffected.
    Safe,
    /// Existing nodes changed type or dependencies, or were removed.
    Breaking,
    /// Same IR as the latest registered version.
    Identical,
    /// Anything the worker does not recognise (including an empty string).
    Unknown(String),
}

impl Compatibility {
    pub fn as_str(&self) -> &str {
        match self {
            Compatibility::New => "NEW",
            Compatibility::Safe => "SAFE",
            Compatibility::Breaking => "BREAKING",
            Compatibility::Identical => "IDENTICAL",
            Compatibility::Unknown(raw) => raw,
        }
    }
}

impl From<String> for Compatibility {
    fn from(raw: String) -> Self {
        match raw.to_ascii_uppercase().as_str() {
            "NEW" => Compatibility::New,
            "SAFE" => Compatibility::Safe,
            "BREAKING" => Compatibility::Breaking,
            "IDENTICAL" => Compatibility::Identical,
            _ => Compatibility::Unknown(raw),
        }
    }
}

impl From<&str> for Compatibility {
    fn from(raw: &str) -> Self {
        Compatibility::from(raw.to_string())
    }
}

impl From<Compatibility> for String {
    fn from(value: Compatibility) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for Compatibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compatibility::Unknown(raw) if raw.is_empty() => f.write_str("UNKNOWN"),
            other => f.write_str(other.as_str()),
        }
    }
}

// ---------------------------------------------------------------------------
// Worker-facing operations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterWorkflowRequest {
    pub workflow_id: String,
    pub version_hash: String,
    pub ir_json: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterWorkflowResponse {
    pub ok: bool,
    pub compatibility: Compatibility,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollTaskRequest {
    pub worker_id: String,
    pub version_hash: String,
}

/// Poll answer. Absence of work is `has_task == false`, not an error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PollTaskResponse {
    pub has_task: bool,
    pub task_id: String,
    pub execution_id: String,
    pub node_id: String,
    pub input_json: String,
    pub idempotency_key: String,
    pub node_type: String,
    pub is_map_subtask: bool,
    pub map_item_json: String,
    pub map_index: u32,
    pub map_total: u32,
}

impl PollTaskResponse {
    /// The "no task available" answer.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Convert into a claimed task, or `None` when no task was handed out.
    pub fn into_assignment(self) -> Option<TaskAssignment> {
        if !self.has_task {
            return None;
        }
        Some(TaskAssignment {
            task_id: self.task_id,
            execution_id: self.execution_id,
            node_id: self.node_id,
            input_json: self.input_json,
            idempotency_key: self.idempotency_key,
            node_type: self.node_type,
            is_map_subtask: self.is_map_subtask,
            map_item_json: self.map_item_json,
            map_index: self.map_index,
            map_total: self.map_total,
        })
    }
}

impl From<TaskAssignment> for PollTaskResponse {
    fn from(task: TaskAssignment) -> Self {
        Self {
            has_task: true,
            task_id: task.task_id,
            execution_id: task.execution_id,
            node_id: task.node_id,
            input_json: task.input_json,
            idempotency_key: task.idempotency_key,
            node_type: task.node_type,
            is_map_subtask: task.is_map_subtask,
            map_item_json: task.map_item_json,
            map_index: task.map_index,
            map_total: task.map_total,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteTaskRequest {
    pub task_id: String,
    pub output_json: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailTaskRequest {
    pub task_id: String,
    pub error_message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AckResponse {
    pub ok: bool,
    pub message: String,
}

impl AckResponse {
    pub fn ok() -> Self {
        Self {
            ok: true,
            message: String::new(),
        }
    }

    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Execution control operations
// ---------------------------------------------------------------------------

/// Lifecycle status of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Completed => "COMPLETED",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartExecutionRequest {
    pub workflow_id: String,
    /// Version to run; `None` selects the latest registered version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_hash: Option<String>,
    pub input: Value,
}

/// Status of one execution with the outputs of its completed nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSnapshot {
    pub execution_id: String,
    pub status: ExecutionStatus,
    /// Outputs keyed by node id, in completion order.
    pub completed_nodes: IndexMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListExecutionsFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ExecutionStatus>,
    #[serde(default = "default_list_limit")]
    pub limit: usize,
}

fn default_list_limit() -> usize {
    20
}

impl Default for ListExecutionsFilter {
    fn default() -> Self {
        Self {
            workflow_id: None,
            status: None,
            limit: default_list_limit(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub execution_id: String,
    pub workflow_id: String,
    pub version_hash: String,
    pub status: ExecutionStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    pub workflow_id: String,
    pub version_hash: String,
    pub compatibility: Compatibility,
    pub registered_at: DateTime<Utc>,
    pub active_executions: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApproveTaskRequest {
    pub execution_id: String,
    pub node_id: String,
    pub approver: String,
    #[serde(default)]
    pub comment: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectTaskRequest {
    pub execution_id: String,
    pub node_id: String,
    pub approver: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingApproval {
    pub execution_id: String,
    pub node_id: String,
    pub workflow_id: String,
    pub started_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
