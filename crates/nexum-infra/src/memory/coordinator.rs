use std::sync::{Mutex, MutexGuard, PoisonError};

use nexum_core::coordinator::{Coordinator, ExecutionControl};
use nexum_types::coordinator::{
    AckResponse, ApproveTaskRequest, CompleteTaskRequest, ExecutionSnapshot, ExecutionSummary,
    FailTaskRequest, ListExecutionsFilter, PendingApproval, PollTaskRequest, PollTaskResponse,
    RegisterWorkflowRequest, RegisterWorkflowResponse, RejectTaskRequest, StartExecutionRequest,
    VersionInfo,
};
use nexum_types::error::CoordinatorError;

use super::state::{ReportRecord, State};

/// In-process coordinator.
///
/// All calls take one lock for their whole (synchronous) body, so every
/// request observes and leaves a consistent scheduling state.
pub struct InMemoryCoordinator {
    state: Mutex<State>,
    max_retries: u32,
}

impl InMemoryCoordinator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            max_retries: 0,
        }
    }

    /// Re-queue a failed task up to `max_retries` times before failing the execution.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of nodes of `execution_id` that have completed.
    pub fn completed_count(&self, execution_id: &str) -> usize {
        self.lock().completed_count(execution_id)
    }

    /// Every complete/fail report received so far, in arrival order.
    pub fn reports(&self) -> Vec<ReportRecord> {
        self.lock().reports().to_vec()
    }

    /// Child executions started by subworkflow nodes of `execution_id`.
    pub fn child_executions(&self, execution_id: &str) -> Vec<String> {
        self.lock().child_executions(execution_id)
    }
}

impl Default for InMemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl Coordinator for InMemoryCoordinator {
    async fn register_workflow(
        &self,
        request: RegisterWorkflowRequest,
    ) -> Result<RegisterWorkflowResponse, CoordinatorError> {
        Ok(self.lock().register(request))
    }

    async fn poll_task(&self, request: PollTaskRequest) -> Result<PollTaskResponse, CoordinatorError> {
        Ok(self.lock().claim(&request.worker_id, &request.version_hash))
    }

    async fn complete_task(
        &self,
        request: CompleteTaskRequest,
    ) -> Result<AckResponse, CoordinatorError> {
        self.lock().complete(&request.task_id, &request.output_json)
    }

    async fn fail_task(&self, request: FailTaskRequest) -> Result<AckResponse, CoordinatorError> {
        self.lock()
            .fail(&request.task_id, &request.error_message, self.max_retries)
    }
}

impl ExecutionControl for InMemoryCoordinator {
    async fn start_execution(
        &self,
        request: StartExecutionRequest,
    ) -> Result<String, CoordinatorError> {
        self.lock().start(
            &request.workflow_id,
            request.version_hash.as_deref(),
            request.input,
        )
    }

    async fn get_status(&self, execution_id: &str) -> Result<ExecutionSnapshot, CoordinatorError> {
        self.lock().snapshot(execution_id)
    }

    async fn list_executions(
        &self,
        filter: ListExecutionsFilter,
    ) -> Result<Vec<ExecutionSummary>, CoordinatorError> {
        Ok(self.lock().list_executions(&filter))
    }

    async fn cancel_execution(&self, execution_id: &str) -> Result<AckResponse, CoordinatorError> {
        self.lock().cancel(execution_id)
    }

    async fn list_workflow_versions(
        &self,
        workflow_id: &str,
    ) -> Result<Vec<VersionInfo>, CoordinatorError> {
        Ok(self.lock().list_versions(workflow_id))
    }

    async fn approve_task(&self, request: ApproveTaskRequest) -> Result<AckResponse, CoordinatorError> {
        self.lock().approve(
            &request.execution_id,
            &request.node_id,
            &request.approver,
            &request.comment,
        )
    }

    async fn reject_task(&self, request: RejectTaskRequest) -> Result<AckResponse, CoordinatorError> {
        self.lock().reject(
            &request.execution_id,
            &request.node_id,
            &request.approver,
            &request.reason,
        )
    }

    async fn get_pending_approvals(
        &self,
        workflow_id: Option<&str>,
    ) -> Result<Vec<PendingApproval>, CoordinatorError> {
        Ok(self.lock().pending_approvals(workflow_id))
    }
}
