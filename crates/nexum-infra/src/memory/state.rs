//! Scheduling state of the in-memory coordinator.
//!
//! Everything here is synchronous and runs under the coordinator's lock.
//! Node completion cascades (router skips, map fan-in, child executions
//! resuming their parent) are resolved eagerly inside one call.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use indexmap::IndexMap;
use nexum_core::workflow::hash::version_hash;
use nexum_types::coordinator::{
    AckResponse, Compatibility, ExecutionSnapshot, ExecutionStatus, ExecutionSummary,
    ListExecutionsFilter, PendingApproval, PollTaskResponse, RegisterWorkflowRequest,
    RegisterWorkflowResponse, VersionInfo,
};
use nexum_types::error::CoordinatorError;
use nexum_types::ir::WorkflowIr;
use nexum_types::node::NodeKind;
use nexum_types::task::MAP_SUBTASK_NODE_TYPE;
use serde_json::{Value, json};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A complete/fail report received from a worker, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum ReportRecord {
    Completed {
        task_id: String,
        execution_id: String,
        node_id: String,
        /// Item index when the report is for a map sub-task.
        map_index: Option<u32>,
        output: Value,
    },
    Failed {
        task_id: String,
        execution_id: String,
        node_id: String,
        error: String,
    },
}

impl ReportRecord {
    pub fn node_id(&self) -> &str {
        match self {
            ReportRecord::Completed { node_id, .. } | ReportRecord::Failed { node_id, .. } => node_id,
        }
    }

    pub fn execution_id(&self) -> &str {
        match self {
            ReportRecord::Completed { execution_id, .. }
            | ReportRecord::Failed { execution_id, .. } => execution_id,
        }
    }

    pub fn is_map_item(&self) -> bool {
        matches!(self, ReportRecord::Completed { map_index: Some(_), .. })
    }
}

struct RegisteredVersion {
    workflow_id: String,
    version_hash: String,
    ir: WorkflowIr,
    compatibility: Compatibility,
    registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskStatus {
    Ready,
    Running,
    AwaitingApproval,
    Done,
    Failed,
    Cancelled,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Ready => "READY",
            TaskStatus::Running => "RUNNING",
            TaskStatus::AwaitingApproval => "AWAITING_APPROVAL",
            TaskStatus::Done => "DONE",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
enum TaskWork {
    Node,
    MapItem { item: Value, index: u32, total: u32 },
    Timer { due_at: DateTime<Utc>, delay_seconds: u64 },
}

struct Task {
    execution_id: String,
    node_id: String,
    version_hash: String,
    idempotency_key: String,
    kind: NodeKind,
    work: TaskWork,
    status: TaskStatus,
    attempts: u32,
    created_at: DateTime<Utc>,
    claimed_at: Option<DateTime<Utc>>,
}

impl Task {
    fn node_type(&self) -> &str {
        match self.work {
            TaskWork::MapItem { .. } => MAP_SUBTASK_NODE_TYPE,
            _ => self.kind.as_str(),
        }
    }

    fn is_open(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Ready | TaskStatus::Running | TaskStatus::AwaitingApproval
        )
    }
}

struct ParentLink {
    execution_id: String,
    node_id: String,
}

struct Execution {
    workflow_id: String,
    version_hash: String,
    input: Value,
    status: ExecutionStatus,
    /// Completed node outputs in completion order.
    outputs: IndexMap<String, Value>,
    skipped: HashSet<String>,
    scheduled: HashSet<String>,
    map_results: HashMap<String, BTreeMap<u32, Value>>,
    error: Option<String>,
    created_at: DateTime<Utc>,
    parent: Option<ParentLink>,
}

fn rejected(message: impl Into<String>) -> AckResponse {
    AckResponse {
        ok: false,
        message: message.into(),
    }
}

fn new_task_id() -> String {
    format!("task-{}", Uuid::now_v7())
}

/// When a timer started at `now` fires. Delays past chrono's range saturate.
fn timer_due_at(now: DateTime<Utc>, delay_seconds: u64) -> DateTime<Utc> {
    i64::try_from(delay_seconds)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(super) struct State {
    /// Registration order.
    versions: Vec<RegisteredVersion>,
    /// Start order.
    executions: IndexMap<String, Execution>,
    /// Creation order; also the claim order.
    tasks: IndexMap<String, Task>,
    reports: Vec<ReportRecord>,
}

impl State {
    fn latest_version(&self, workflow_id: &str) -> Option<&RegisteredVersion> {
        self.versions.iter().rev().find(|v| v.workflow_id == workflow_id)
    }

    pub fn reports(&self) -> &[ReportRecord] {
        &self.reports
    }

    pub fn completed_count(&self, execution_id: &str) -> usize {
        self.executions
            .get(execution_id)
            .map_or(0, |exec| exec.outputs.len())
    }

    /// Executions started on behalf of `parent_execution_id`'s subworkflow nodes.
    pub fn child_executions(&self, parent_execution_id: &str) -> Vec<String> {
        self.executions
            .iter()
            .filter(|(_, exec)| {
                exec.parent
                    .as_ref()
                    .is_some_and(|p| p.execution_id == parent_execution_id)
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    pub fn register(&mut self, request: RegisterWorkflowRequest) -> RegisterWorkflowResponse {
        let reject = |message: String| RegisterWorkflowResponse {
            ok: false,
            compatibility: Compatibility::Unknown(String::new()),
            message,
        };

        if request.workflow_id.trim().is_empty() {
            return reject("workflow id must not be empty".to_string());
        }
        let ir = match WorkflowIr::from_json(&request.ir_json) {
            Ok(ir) => ir,
            Err(e) => return reject(format!("invalid IR: {e}")),
        };
        let expected = version_hash(&request.ir_json);
        if expected != request.version_hash {
            return reject(format!(
                "version hash mismatch: got {}, IR hashes to {expected}",
                request.version_hash
            ));
        }

        let is_latest = self
            .latest_version(&request.workflow_id)
            .is_some_and(|v| v.version_hash == request.version_hash);
        if is_latest {
            tracing::debug!(
                workflow_id = %request.workflow_id,
                version_hash = %request.version_hash,
                "workflow version already registered"
            );
            return RegisterWorkflowResponse {
                ok: true,
                compatibility: Compatibility::Identical,
                message: String::new(),
            };
        }

        let compatibility = match self.latest_version(&request.workflow_id) {
            None => Compatibility::New,
            Some(_) => Compatibility::Unknown("UNKNOWN".to_string()),
        };
        // An older version registered again becomes the latest.
        self.versions.retain(|v| {
            v.workflow_id != request.workflow_id || v.version_hash != request.version_hash
        });
        tracing::info!(
            workflow_id = %request.workflow_id,
            version_hash = %request.version_hash,
            compatibility = %compatibility,
            nodes = ir.len(),
            "workflow version registered"
        );
        self.versions.push(RegisteredVersion {
            workflow_id: request.workflow_id,
            version_hash: request.version_hash,
            ir,
            compatibility: compatibility.clone(),
            registered_at: Utc::now(),
        });
        RegisterWorkflowResponse {
            ok: true,
            compatibility,
            message: String::new(),
        }
    }

    pub fn list_versions(&self, workflow_id: &str) -> Vec<VersionInfo> {
        self.versions
            .iter()
            .filter(|v| v.workflow_id == workflow_id)
            .map(|v| VersionInfo {
                workflow_id: v.workflow_id.clone(),
                version_hash: v.version_hash.clone(),
                compatibility: v.compatibility.clone(),
                registered_at: v.registered_at,
                active_executions: self
                    .executions
                    .values()
                    .filter(|e| {
                        e.version_hash == v.version_hash && e.status == ExecutionStatus::Running
                    })
                    .count() as u32,
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    pub fn start(
        &mut self,
        workflow_id: &str,
        version_hash: Option<&str>,
        input: Value,
    ) -> Result<String, CoordinatorError> {
        self.start_linked(workflow_id, version_hash, input, None)
    }

    fn start_linked(
        &mut self,
        workflow_id: &str,
        version_hash: Option<&str>,
        input: Value,
        parent: Option<ParentLink>,
    ) -> Result<String, CoordinatorError> {
        let version = match version_hash {
            Some(hash) => self
                .versions
                .iter()
                .find(|v| v.workflow_id == workflow_id && v.version_hash == hash),
            None => self.latest_version(workflow_id),
        }
        .ok_or_else(|| {
            CoordinatorError::NotFound(format!(
                "workflow '{workflow_id}' ({})",
                version_hash.unwrap_or("latest")
            ))
        })?;

        let execution_id = format!("exec-{}", Uuid::now_v7());
        let version_hash = version.version_hash.clone();
        tracing::info!(
            execution_id = %execution_id,
            workflow_id,
            version_hash = %version_hash,
            parent_execution_id = parent.as_ref().map(|p| p.execution_id.as_str()),
            "execution started"
        );
        self.executions.insert(
            execution_id.clone(),
            Execution {
                workflow_id: workflow_id.to_string(),
                version_hash,
                input,
                status: ExecutionStatus::Running,
                outputs: IndexMap::new(),
                skipped: HashSet::new(),
                scheduled: HashSet::new(),
                map_results: HashMap::new(),
                error: None,
                created_at: Utc::now(),
                parent,
            },
        );
        self.schedule_ready(&execution_id);
        self.check_complete(&execution_id);
        Ok(execution_id)
    }

    pub fn snapshot(&self, execution_id: &str) -> Result<ExecutionSnapshot, CoordinatorError> {
        let exec = self
            .executions
            .get(execution_id)
            .ok_or_else(|| CoordinatorError::NotFound(format!("execution {execution_id}")))?;
        Ok(ExecutionSnapshot {
            execution_id: execution_id.to_string(),
            status: exec.status,
            completed_nodes: exec.outputs.clone(),
            error: exec.error.clone(),
        })
    }

    pub fn list_executions(&self, filter: &ListExecutionsFilter) -> Vec<ExecutionSummary> {
        self.executions
            .iter()
            .rev()
            .filter(|(_, e)| {
                filter
                    .workflow_id
                    .as_deref()
                    .is_none_or(|id| id == e.workflow_id)
            })
            .filter(|(_, e)| filter.status.is_none_or(|s| s == e.status))
            .take(filter.limit)
            .map(|(id, e)| ExecutionSummary {
                execution_id: id.clone(),
                workflow_id: e.workflow_id.clone(),
                version_hash: e.version_hash.clone(),
                status: e.status,
                created_at: e.created_at,
            })
            .collect()
    }

    pub fn cancel(&mut self, execution_id: &str) -> Result<AckResponse, CoordinatorError> {
        let exec = self
            .executions
            .get_mut(execution_id)
            .ok_or_else(|| CoordinatorError::NotFound(format!("execution {execution_id}")))?;
        if exec.status.is_terminal() {
            return Ok(rejected(format!(
                "execution {execution_id} is already {}",
                exec.status
            )));
        }
        exec.status = ExecutionStatus::Cancelled;
        self.close_tasks(execution_id, TaskStatus::Cancelled);
        tracing::info!(execution_id, "execution cancelled");

        for child in self.child_executions(execution_id) {
            let running = self
                .executions
                .get(&child)
                .is_some_and(|e| e.status == ExecutionStatus::Running);
            if running {
                self.cancel(&child)?;
            }
        }
        Ok(AckResponse::with_message("cancelled"))
    }

    /// Queue every node of `execution_id` whose dependencies are all
    /// completed or skipped.
    fn schedule_ready(&mut self, execution_id: &str) {
        let Some(exec) = self.executions.get_mut(execution_id) else {
            return;
        };
        if exec.status != ExecutionStatus::Running {
            return;
        }
        let Some(version) = self.versions.iter().find(|v| v.version_hash == exec.version_hash)
        else {
            return;
        };

        let now = Utc::now();
        for (node_id, node) in version.ir.iter() {
            if exec.outputs.contains_key(node_id)
                || exec.scheduled.contains(node_id)
                || exec.skipped.contains(node_id)
            {
                continue;
            }
            let ready = node
                .dependencies()
                .iter()
                .all(|dep| exec.outputs.contains_key(dep) || exec.skipped.contains(dep));
            if !ready {
                continue;
            }

            let work = match node.delay_seconds() {
                Some(delay_seconds) => TaskWork::Timer {
                    due_at: timer_due_at(now, delay_seconds),
                    delay_seconds,
                },
                None => TaskWork::Node,
            };
            let task_id = new_task_id();
            tracing::debug!(
                execution_id,
                node_id,
                task_id = %task_id,
                node_type = %node.kind(),
                "task scheduled"
            );
            exec.scheduled.insert(node_id.to_string());
            self.tasks.insert(
                task_id,
                Task {
                    execution_id: execution_id.to_string(),
                    node_id: node_id.to_string(),
                    version_hash: exec.version_hash.clone(),
                    idempotency_key: format!("{execution_id}:{node_id}:{}", exec.version_hash),
                    kind: node.kind(),
                    work,
                    status: TaskStatus::Ready,
                    attempts: 0,
                    created_at: now,
                    claimed_at: None,
                },
            );
        }
    }

    /// Mark the execution COMPLETED once every node is completed or skipped,
    /// resuming the parent subworkflow node if there is one.
    fn check_complete(&mut self, execution_id: &str) {
        let Some(exec) = self.executions.get_mut(execution_id) else {
            return;
        };
        if exec.status != ExecutionStatus::Running {
            return;
        }
        let Some(version) = self.versions.iter().find(|v| v.version_hash == exec.version_hash)
        else {
            return;
        };
        let done = version
            .ir
            .iter()
            .all(|(id, _)| exec.outputs.contains_key(id) || exec.skipped.contains(id));
        if !done {
            return;
        }

        exec.status = ExecutionStatus::Completed;
        tracing::info!(execution_id, nodes = exec.outputs.len(), "execution completed");

        let Some(parent) = exec.parent.as_ref() else {
            return;
        };
        let parent_execution = parent.execution_id.clone();
        let parent_node = parent.node_id.clone();
        let output = exec
            .outputs
            .last()
            .map(|(_, v)| v.clone())
            .unwrap_or(Value::Null);

        if let Some(task) = self.tasks.values_mut().find(|t| {
            t.execution_id == parent_execution && t.node_id == parent_node && t.status == TaskStatus::Running
        }) {
            task.status = TaskStatus::Done;
        }
        tracing::info!(
            child_execution_id = execution_id,
            execution_id = %parent_execution,
            node_id = %parent_node,
            "child execution completed, resuming parent"
        );
        self.complete_node(&parent_execution, &parent_node, output);
    }

    fn complete_node(&mut self, execution_id: &str, node_id: &str, output: Value) {
        let Some(exec) = self.executions.get_mut(execution_id) else {
            return;
        };
        if exec.status != ExecutionStatus::Running {
            return;
        }

        if let Some(routes) = self
            .versions
            .iter()
            .find(|v| v.version_hash == exec.version_hash)
            .and_then(|v| v.ir.node(node_id))
            .and_then(|n| n.routes())
        {
            let routed_to = output
                .get("routed_to")
                .and_then(Value::as_str)
                .unwrap_or_default();
            for route in routes.iter().filter(|r| r.target != routed_to) {
                exec.skipped.insert(route.target.clone());
            }
            tracing::info!(execution_id, router = node_id, routed_to, "router decision");
        }
        exec.outputs.insert(node_id.to_string(), output);

        self.schedule_ready(execution_id);
        self.check_complete(execution_id);
    }

    fn fail_execution(&mut self, execution_id: &str, error: String) {
        let Some(exec) = self.executions.get_mut(execution_id) else {
            return;
        };
        if exec.status != ExecutionStatus::Running {
            return;
        }
        tracing::warn!(execution_id, error = %error, "execution failed");
        exec.status = ExecutionStatus::Failed;
        exec.error = Some(error.clone());
        let parent = exec
            .parent
            .as_ref()
            .map(|p| (p.execution_id.clone(), p.node_id.clone()));
        self.close_tasks(execution_id, TaskStatus::Cancelled);

        if let Some((parent_execution, parent_node)) = parent {
            self.fail_execution(
                &parent_execution,
                format!("subworkflow node '{parent_node}' failed: {error}"),
            );
        }
    }

    fn close_tasks(&mut self, execution_id: &str, status: TaskStatus) {
        for task in self
            .tasks
            .values_mut()
            .filter(|t| t.execution_id == execution_id && t.is_open())
        {
            task.status = status;
        }
    }

    // -----------------------------------------------------------------------
    // Task protocol
    // -----------------------------------------------------------------------

    /// Claim the oldest ready task of `version_hash`. Due timers of every
    /// execution are resolved first and never handed out.
    pub fn claim(&mut self, worker_id: &str, version_hash: &str) -> PollTaskResponse {
        self.fire_due_timers(Utc::now());

        let executions = &self.executions;
        let Some((task_id, task)) = self.tasks.iter_mut().find(|(_, t)| {
            t.status == TaskStatus::Ready
                && t.version_hash == version_hash
                && !matches!(t.work, TaskWork::Timer { .. })
                && executions
                    .get(&t.execution_id)
                    .is_some_and(|e| e.status == ExecutionStatus::Running)
        }) else {
            return PollTaskResponse::empty();
        };

        task.status = if task.kind == NodeKind::HumanApproval {
            TaskStatus::AwaitingApproval
        } else {
            TaskStatus::Running
        };
        task.claimed_at = Some(Utc::now());

        let Some(exec) = executions.get(&task.execution_id) else {
            return PollTaskResponse::empty();
        };
        let deps: serde_json::Map<String, Value> = self
            .versions
            .iter()
            .find(|v| v.version_hash == task.version_hash)
            .and_then(|v| v.ir.dependencies(&task.node_id))
            .unwrap_or_default()
            .iter()
            .filter_map(|dep| exec.outputs.get(dep).map(|out| (dep.clone(), out.clone())))
            .collect();
        let input_json = json!({ "input": exec.input, "deps": deps }).to_string();

        let (map_item_json, map_index, map_total) = match &task.work {
            TaskWork::MapItem { item, index, total } => (item.to_string(), *index, *total),
            _ => (String::new(), 0, 0),
        };
        tracing::debug!(
            worker_id,
            task_id = %task_id,
            execution_id = %task.execution_id,
            node_id = %task.node_id,
            "task claimed"
        );

        PollTaskResponse {
            has_task: true,
            task_id: task_id.clone(),
            execution_id: task.execution_id.clone(),
            node_id: task.node_id.clone(),
            input_json,
            idempotency_key: task.idempotency_key.clone(),
            node_type: task.node_type().to_string(),
            is_map_subtask: matches!(task.work, TaskWork::MapItem { .. }),
            map_item_json,
            map_index,
            map_total,
        }
    }

    fn fire_due_timers(&mut self, now: DateTime<Utc>) {
        let executions = &self.executions;
        let due: Vec<(String, String, u64)> = self
            .tasks
            .values_mut()
            .filter(|t| t.status == TaskStatus::Ready)
            .filter(|t| {
                executions
                    .get(&t.execution_id)
                    .is_some_and(|e| e.status == ExecutionStatus::Running)
            })
            .filter_map(|t| match t.work {
                TaskWork::Timer { due_at, delay_seconds } if due_at <= now => {
                    t.status = TaskStatus::Done;
                    Some((t.execution_id.clone(), t.node_id.clone(), delay_seconds))
                }
                _ => None,
            })
            .collect();

        for (execution_id, node_id, delay_seconds) in due {
            tracing::info!(
                execution_id = %execution_id,
                node_id = %node_id,
                delay_seconds,
                "timer fired"
            );
            let output = json!({
                "waited_until": now.to_rfc3339(),
                "delay_seconds": delay_seconds,
            });
            self.complete_node(&execution_id, &node_id, output);
        }
    }

    /// Look up a task a worker may report on.
    fn reportable(&self, task_id: &str) -> Result<Result<&Task, AckResponse>, CoordinatorError> {
        let task = self
            .tasks
            .get(task_id)
            .ok_or_else(|| CoordinatorError::NotFound(format!("task {task_id}")))?;
        if task.status != TaskStatus::Running {
            return Ok(Err(rejected(format!("task {task_id} is {}", task.status))));
        }
        Ok(Ok(task))
    }

    pub fn complete(
        &mut self,
        task_id: &str,
        output_json: &str,
    ) -> Result<AckResponse, CoordinatorError> {
        let task = match self.reportable(task_id)? {
            Ok(task) => task,
            Err(ack) => return Ok(ack),
        };
        let output: Value = serde_json::from_str(output_json).map_err(|e| {
            CoordinatorError::Protocol(format!("output of task {task_id} is not JSON: {e}"))
        })?;

        let execution_id = task.execution_id.clone();
        let node_id = task.node_id.clone();
        let version_hash = task.version_hash.clone();
        let kind = task.kind;
        let work = task.work.clone();
        self.reports.push(ReportRecord::Completed {
            task_id: task_id.to_string(),
            execution_id: execution_id.clone(),
            node_id: node_id.clone(),
            map_index: match work {
                TaskWork::MapItem { index, .. } => Some(index),
                _ => None,
            },
            output: output.clone(),
        });

        match work {
            TaskWork::MapItem { index, total, .. } => {
                self.set_task_status(task_id, TaskStatus::Done);
                self.collect_map_item(&execution_id, &node_id, index, total, output);
            }
            TaskWork::Node if kind == NodeKind::Map => {
                self.set_task_status(task_id, TaskStatus::Done);
                let Value::Array(items) = output else {
                    let message = format!("map node '{node_id}' must complete with an item array");
                    self.fail_execution(&execution_id, message.clone());
                    return Err(CoordinatorError::Protocol(message));
                };
                self.fan_out(&execution_id, &node_id, &version_hash, items);
            }
            TaskWork::Node if kind == NodeKind::Subworkflow => {
                return Ok(self.start_child(&execution_id, &node_id, output));
            }
            _ => {
                self.set_task_status(task_id, TaskStatus::Done);
                tracing::debug!(execution_id = %execution_id, node_id = %node_id, "node completed");
                self.complete_node(&execution_id, &node_id, output);
            }
        }
        Ok(AckResponse::ok())
    }

    pub fn fail(
        &mut self,
        task_id: &str,
        error_message: &str,
        max_retries: u32,
    ) -> Result<AckResponse, CoordinatorError> {
        let task = match self.reportable(task_id)? {
            Ok(task) => task,
            Err(ack) => return Ok(ack),
        };
        let execution_id = task.execution_id.clone();
        let node_id = task.node_id.clone();
        let attempts = task.attempts;
        self.reports.push(ReportRecord::Failed {
            task_id: task_id.to_string(),
            execution_id: execution_id.clone(),
            node_id: node_id.clone(),
            error: error_message.to_string(),
        });

        if attempts < max_retries {
            if let Some(task) = self.tasks.get_mut(task_id) {
                task.attempts += 1;
                task.status = TaskStatus::Ready;
                task.claimed_at = None;
            }
            tracing::warn!(
                task_id,
                execution_id = %execution_id,
                node_id = %node_id,
                retry = attempts + 1,
                max_retries,
                error = error_message,
                "task failed, retrying"
            );
            return Ok(AckResponse::with_message("retrying"));
        }

        self.set_task_status(task_id, TaskStatus::Failed);
        self.fail_execution(
            &execution_id,
            format!("node '{node_id}' failed: {error_message}"),
        );
        Ok(AckResponse::ok())
    }

    fn set_task_status(&mut self, task_id: &str, status: TaskStatus) {
        if let Some(task) = self.tasks.get_mut(task_id) {
            task.status = status;
        }
    }

    fn fan_out(&mut self, execution_id: &str, node_id: &str, version_hash: &str, items: Vec<Value>) {
        tracing::info!(execution_id, node_id, total = items.len(), "map fan-out");
        if items.is_empty() {
            self.complete_node(execution_id, node_id, Value::Array(Vec::new()));
            return;
        }
        let total = items.len() as u32;
        let now = Utc::now();
        for (index, item) in items.into_iter().enumerate() {
            let index = index as u32;
            self.tasks.insert(
                new_task_id(),
                Task {
                    execution_id: execution_id.to_string(),
                    node_id: node_id.to_string(),
                    version_hash: version_hash.to_string(),
                    idempotency_key: format!("{execution_id}:{node_id}__{index}:{version_hash}"),
                    kind: NodeKind::Map,
                    work: TaskWork::MapItem { item, index, total },
                    status: TaskStatus::Ready,
                    attempts: 0,
                    created_at: now,
                    claimed_at: None,
                },
            );
        }
    }

    fn collect_map_item(
        &mut self,
        execution_id: &str,
        node_id: &str,
        index: u32,
        total: u32,
        output: Value,
    ) {
        let Some(exec) = self.executions.get_mut(execution_id) else {
            return;
        };
        let results = exec.map_results.entry(node_id.to_string()).or_default();
        results.insert(index, output);
        tracing::debug!(
            execution_id,
            node_id,
            completed = results.len(),
            total,
            "map item completed"
        );
        if results.len() < total as usize {
            return;
        }
        let ordered: Vec<Value> = exec
            .map_results
            .remove(node_id)
            .map(|r| r.into_values().collect())
            .unwrap_or_default();
        self.complete_node(execution_id, node_id, Value::Array(ordered));
    }

    /// Phase 1 of a subworkflow: start the child from its latest version.
    /// The parent task stays RUNNING until the child completes.
    fn start_child(&mut self, execution_id: &str, node_id: &str, request: Value) -> AckResponse {
        let Some(child_workflow) = request.get("subWorkflowId").and_then(Value::as_str) else {
            let message = format!("subworkflow node '{node_id}' completed without subWorkflowId");
            self.fail_execution(execution_id, message.clone());
            return rejected(message);
        };
        let child_input = request.get("childInput").cloned().unwrap_or(Value::Null);
        let parent = ParentLink {
            execution_id: execution_id.to_string(),
            node_id: node_id.to_string(),
        };
        match self.start_linked(child_workflow, None, child_input, Some(parent)) {
            Ok(child) => AckResponse::with_message(child),
            Err(e) => {
                let message = format!("subworkflow node '{node_id}' could not start child: {e}");
                self.fail_execution(execution_id, message.clone());
                rejected(message)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Human approval
    // -----------------------------------------------------------------------

    fn awaiting_approval(
        &self,
        execution_id: &str,
        node_id: &str,
    ) -> Result<String, CoordinatorError> {
        self.tasks
            .iter()
            .find(|(_, t)| {
                t.execution_id == execution_id
                    && t.node_id == node_id
                    && t.status == TaskStatus::AwaitingApproval
            })
            .map(|(id, _)| id.clone())
            .ok_or_else(|| {
                CoordinatorError::NotFound(format!(
                    "no pending approval for node '{node_id}' in execution {execution_id}"
                ))
            })
    }

    pub fn approve(
        &mut self,
        execution_id: &str,
        node_id: &str,
        approver: &str,
        comment: &str,
    ) -> Result<AckResponse, CoordinatorError> {
        let task_id = self.awaiting_approval(execution_id, node_id)?;
        self.set_task_status(&task_id, TaskStatus::Done);
        tracing::info!(execution_id, node_id, approver, "approval granted");
        let output = json!({ "approved": true, "approver": approver, "comment": comment });
        self.complete_node(execution_id, node_id, output);
        Ok(AckResponse::with_message("approved"))
    }

    pub fn reject(
        &mut self,
        execution_id: &str,
        node_id: &str,
        approver: &str,
        reason: &str,
    ) -> Result<AckResponse, CoordinatorError> {
        let task_id = self.awaiting_approval(execution_id, node_id)?;
        self.set_task_status(&task_id, TaskStatus::Failed);
        tracing::warn!(execution_id, node_id, approver, reason, "approval rejected");
        self.fail_execution(execution_id, format!("rejected by {approver}: {reason}"));
        Ok(AckResponse::with_message("rejected"))
    }

    pub fn pending_approvals(&self, workflow_id: Option<&str>) -> Vec<PendingApproval> {
        self.tasks
            .values()
            .filter(|t| t.status == TaskStatus::AwaitingApproval)
            .filter_map(|t| {
                let exec = self.executions.get(&t.execution_id)?;
                let wanted = exec.status == ExecutionStatus::Running
                    && workflow_id.is_none_or(|id| id == exec.workflow_id);
                wanted.then(|| PendingApproval {
                    execution_id: t.execution_id.clone(),
                    node_id: t.node_id.clone(),
                    workflow_id: exec.workflow_id.clone(),
                    started_at: t.claimed_at.unwrap_or(t.created_at),
                })
            })
            .collect()
    }
}
