//! Coordinator ports.
//!
//! The remote coordinator persists executions, leases tasks, and resolves
//! the coordinator-side node kinds. The worker consumes it only through
//! [`Coordinator`]; operators and tests drive executions through
//! [`ExecutionControl`]. `nexum-infra` provides an in-memory implementation
//! of both; a networked client implements the same traits over its transport.
//!
//! Uses native async fn in traits (Rust 2024 edition, no async_trait macro).

use nexum_types::coordinator::{
    AckResponse, ApproveTaskRequest, CompleteTaskRequest, ExecutionSnapshot, ExecutionSummary,
    FailTaskRequest, ListExecutionsFilter, PendingApproval, PollTaskRequest, PollTaskResponse,
    RegisterWorkflowRequest, RegisterWorkflowResponse, RejectTaskRequest, StartExecutionRequest,
    VersionInfo,
};
use nexum_types::error::CoordinatorError;

/// The four operations a worker needs.
pub trait Coordinator: Send + Sync {
    /// Register a workflow version. The returned compatibility is informational.
    fn register_workflow(
        &self,
        request: RegisterWorkflowRequest,
    ) -> impl std::future::Future<Output = Result<RegisterWorkflowResponse, CoordinatorError>> + Send;

    /// Claim one ready task for the given version, if any.
    fn poll_task(
        &self,
        request: PollTaskRequest,
    ) -> impl std::future::Future<Output = Result<PollTaskResponse, CoordinatorError>> + Send;

    /// Report a task's successful output.
    fn complete_task(
        &self,
        request: CompleteTaskRequest,
    ) -> impl std::future::Future<Output = Result<AckResponse, CoordinatorError>> + Send;

    /// Report a task failure.
    fn fail_task(
        &self,
        request: FailTaskRequest,
    ) -> impl std::future::Future<Output = Result<AckResponse, CoordinatorError>> + Send;
}

/// Execution lifecycle and approval operations.
pub trait ExecutionControl: Send + Sync {
    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    /// Start an execution. Returns its id.
    fn start_execution(
        &self,
        request: StartExecutionRequest,
    ) -> impl std::future::Future<Output = Result<String, CoordinatorError>> + Send;

    fn get_status(
        &self,
        execution_id: &str,
    ) -> impl std::future::Future<Output = Result<ExecutionSnapshot, CoordinatorError>> + Send;

    /// Most recent executions first.
    fn list_executions(
        &self,
        filter: ListExecutionsFilter,
    ) -> impl std::future::Future<Output = Result<Vec<ExecutionSummary>, CoordinatorError>> + Send;

    fn cancel_execution(
        &self,
        execution_id: &str,
    ) -> impl std::future::Future<Output = Result<AckResponse, CoordinatorError>> + Send;

    /// Registered versions of a workflow, oldest first.
    fn list_workflow_versions(
        &self,
        workflow_id: &str,
    ) -> impl std::future::Future<Output = Result<Vec<VersionInfo>, CoordinatorError>> + Send;

    // -----------------------------------------------------------------------
    // Human approval
    // -----------------------------------------------------------------------

    fn approve_task(
        &self,
        request: ApproveTaskRequest,
    ) -> impl std::future::Future<Output = Result<AckResponse, CoordinatorError>> + Send;

    /// Reject an approval. The execution fails with the given reason.
    fn reject_task(
        &self,
        request: RejectTaskRequest,
    ) -> impl std::future::Future<Output = Result<AckResponse, CoordinatorError>> + Send;

    /// Approvals waiting on a human, optionally scoped to one workflow.
    fn get_pending_approvals(
        &self,
        workflow_id: Option<&str>,
    ) -> impl std::future::Future<Output = Result<Vec<PendingApproval>, CoordinatorError>> + Send;
}
