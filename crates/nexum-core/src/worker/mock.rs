//! Scripted coordinator for worker tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use indexmap::IndexMap;
use nexum_types::coordinator::{
    AckResponse, ApproveTaskRequest, CompleteTaskRequest, Compatibility, ExecutionSnapshot,
    ExecutionStatus, ExecutionSummary, FailTaskRequest, ListExecutionsFilter, PendingApproval,
    PollTaskRequest, PollTaskResponse, RegisterWorkflowRequest, RegisterWorkflowResponse,
    RejectTaskRequest, StartExecutionRequest, VersionInfo,
};
use nexum_types::error::CoordinatorError;
use nexum_types::task::TaskAssignment;

use crate::coordinator::{Coordinator, ExecutionControl};

/// A task for `node_id` with the given input payload.
pub fn task(task_id: &str, node_id: &str, input_json: &str) -> TaskAssignment {
    TaskAssignment {
        task_id: task_id.to_string(),
        execution_id: "exec-1".to_string(),
        node_id: node_id.to_string(),
        input_json: input_json.to_string(),
        idempotency_key: format!("exec-1:{node_id}:sha256:test"),
        node_type: String::new(),
        is_map_subtask: false,
        map_item_json: String::new(),
        map_index: 0,
        map_total: 0,
    }
}

/// Hands out queued tasks and records every report.
pub struct MockCoordinator {
    tasks: Mutex<VecDeque<TaskAssignment>>,
    compatibility: Mutex<Compatibility>,
    reject_registration: AtomicBool,
    poll_failures: AtomicUsize,
    fail_reports: AtomicBool,
    pub polls: AtomicUsize,
    registrations: Mutex<Vec<RegisterWorkflowRequest>>,
    completed: Mutex<Vec<CompleteTaskRequest>>,
    failed: Mutex<Vec<FailTaskRequest>>,
    /// Queued by the next status check, which then waits for their reports.
    deferred: Mutex<Vec<TaskAssignment>>,
}

impl Default for MockCoordinator {
    fn default() -> Self {
        Self {
            tasks: Mutex::new(VecDeque::new()),
            compatibility: Mutex::new(Compatibility::New),
            reject_registration: AtomicBool::new(false),
            poll_failures: AtomicUsize::new(0),
            fail_reports: AtomicBool::new(false),
            polls: AtomicUsize::new(0),
            registrations: Mutex::new(Vec::new()),
            completed: Mutex::new(Vec::new()),
            failed: Mutex::new(Vec::new()),
            deferred: Mutex::new(Vec::new()),
        }
    }
}

impl MockCoordinator {
    pub fn push(&self, task: TaskAssignment) {
        self.tasks.lock().unwrap().push_back(task);
    }

    /// Hold `task` back until a status check releases it. That check only
    /// answers once every released task has been reported.
    pub fn defer_until_status(&self, task: TaskAssignment) {
        self.deferred.lock().unwrap().push(task);
    }

    pub fn set_compatibility(&self, compatibility: Compatibility) {
        *self.compatibility.lock().unwrap() = compatibility;
    }

    /// Make registration fail with a transport error.
    pub fn reject_registration(&self) {
        self.reject_registration.store(true, Ordering::SeqCst);
    }

    /// Fail the next `n` polls with a transport error.
    pub fn fail_next_polls(&self, n: usize) {
        self.poll_failures.store(n, Ordering::SeqCst);
    }

    /// Make complete/fail reports return a transport error.
    pub fn fail_reports(&self, fail: bool) {
        self.fail_reports.store(fail, Ordering::SeqCst);
    }

    pub fn registrations(&self) -> Vec<RegisterWorkflowRequest> {
        self.registrations.lock().unwrap().clone()
    }

    pub fn completed(&self) -> Vec<CompleteTaskRequest> {
        self.completed.lock().unwrap().clone()
    }

    pub fn failed(&self) -> Vec<FailTaskRequest> {
        self.failed.lock().unwrap().clone()
    }

    pub fn reported(&self) -> usize {
        self.completed.lock().unwrap().len() + self.failed.lock().unwrap().len()
    }

    fn report_error(&self) -> Option<CoordinatorError> {
        self.fail_reports
            .load(Ordering::SeqCst)
            .then(|| CoordinatorError::Unavailable("connection reset".to_string()))
    }
}

impl Coordinator for MockCoordinator {
    async fn register_workflow(
        &self,
        request: RegisterWorkflowRequest,
    ) -> Result<RegisterWorkflowResponse, CoordinatorError> {
        if self.reject_registration.load(Ordering::SeqCst) {
            return Err(CoordinatorError::Unavailable("connection refused".to_string()));
        }
        self.registrations.lock().unwrap().push(request);
        Ok(RegisterWorkflowResponse {
            ok: true,
            compatibility: self.compatibility.lock().unwrap().clone(),
            message: String::new(),
        })
    }

    async fn poll_task(
        &self,
        _request: PollTaskRequest,
    ) -> Result<PollTaskResponse, CoordinatorError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .poll_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(CoordinatorError::Unavailable("connection refused".to_string()));
        }
        Ok(match self.tasks.lock().unwrap().pop_front() {
            Some(task) => PollTaskResponse::from(task),
            None => PollTaskResponse::empty(),
        })
    }

    async fn complete_task(
        &self,
        request: CompleteTaskRequest,
    ) -> Result<AckResponse, CoordinatorError> {
        if let Some(e) = self.report_error() {
            return Err(e);
        }
        self.completed.lock().unwrap().push(request);
        Ok(AckResponse::ok())
    }

    async fn fail_task(&self, request: FailTaskRequest) -> Result<AckResponse, CoordinatorError> {
        if let Some(e) = self.report_error() {
            return Err(e);
        }
        self.failed.lock().unwrap().push(request);
        Ok(AckResponse::ok())
    }
}

impl ExecutionControl for MockCoordinator {
    async fn start_execution(&self, _request: StartExecutionRequest) -> Result<String, CoordinatorError> {
        Ok("exec-1".to_string())
    }

    async fn get_status(&self, execution_id: &str) -> Result<ExecutionSnapshot, CoordinatorError> {
        let released: Vec<TaskAssignment> = self.deferred.lock().unwrap().drain(..).collect();
        let target = self.reported() + released.len();
        self.tasks.lock().unwrap().extend(released);
        while self.reported() < target {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        Ok(ExecutionSnapshot {
            execution_id: execution_id.to_string(),
            status: ExecutionStatus::Completed,
            completed_nodes: IndexMap::new(),
            error: None,
        })
    }

    async fn list_executions(
        &self,
        _filter: ListExecutionsFilter,
    ) -> Result<Vec<ExecutionSummary>, CoordinatorError> {
        Ok(Vec::new())
    }

    async fn cancel_execution(&self, execution_id: &str) -> Result<AckResponse, CoordinatorError> {
        Err(CoordinatorError::NotFound(format!("execution {execution_id}")))
    }

    async fn list_workflow_versions(
        &self,
        _workflow_id: &str,
    ) -> Result<Vec<VersionInfo>, CoordinatorError> {
        Ok(Vec::new())
    }

    async fn approve_task(&self, request: ApproveTaskRequest) -> Result<AckResponse, CoordinatorError> {
        Err(CoordinatorError::NotFound(format!("approval {}", request.node_id)))
    }

    async fn reject_task(&self, request: RejectTaskRequest) -> Result<AckResponse, CoordinatorError> {
        Err(CoordinatorError::NotFound(format!("approval {}", request.node_id)))
    }

    async fn get_pending_approvals(
        &self,
        _workflow_id: Option<&str>,
    ) -> Result<Vec<PendingApproval>, CoordinatorError> {
        Ok(Vec::new())
    }
}
