//! Worker: registers built workflows and runs the task poll loop.
//!
//! # Lifecycle
//!
//! `STOPPED -> STARTING (register every workflow) -> RUNNING (poll loop)
//! -> STOPPING (drain in-flight dispatches) -> STOPPED`.
//!
//! # Concurrency
//!
//! A `Semaphore` with `concurrency` permits bounds the number of in-flight
//! dispatches. The loop acquires a permit before every claim attempt and
//! moves it into the spawned dispatch, so polling stalls (rather than
//! errors) while the bound is saturated. Dispatches run in a `JoinSet` and
//! never block the loop. `stop()` cancels a `CancellationToken` checked at
//! the top of each iteration and during backoff sleeps; in-flight dispatches
//! are allowed to finish and report.

pub mod dispatch;

#[cfg(test)]
pub(crate) mod mock;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use indexmap::IndexMap;
use nexum_types::coordinator::{
    Compatibility, ExecutionSnapshot, ExecutionStatus, PollTaskRequest, RegisterWorkflowRequest,
    RegisterWorkflowResponse,
};
use nexum_types::error::CoordinatorError;
use nexum_types::task::TaskAssignment;
use nexum_types::worker::{WorkerConfig, WorkerState};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::coordinator::{Coordinator, ExecutionControl};
use crate::workflow::definition::BuiltWorkflow;

use self::dispatch::DispatchOutcome;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that end a worker run.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Registration is the only fatal coordinator failure.
    #[error("failed to register workflow '{workflow_id}': {source}")]
    Registration {
        workflow_id: String,
        #[source]
        source: CoordinatorError,
    },

    #[error("worker is already running")]
    AlreadyRunning,

    #[error("failed to query execution status: {0}")]
    Status(#[source] CoordinatorError),

    #[error("execution '{execution_id}' failed: {message}")]
    ExecutionFailed {
        execution_id: String,
        message: String,
    },

    #[error("execution '{0}' was cancelled")]
    ExecutionCancelled(String),

    #[error("execution '{execution_id}' did not complete within {timeout:?}")]
    Timeout {
        execution_id: String,
        timeout: Duration,
    },

    #[error("worker stopped before execution '{0}' finished")]
    Stopped(String),
}

// ---------------------------------------------------------------------------
// In-flight bookkeeping
// ---------------------------------------------------------------------------

/// A task currently being dispatched.
#[derive(Debug, Clone)]
pub struct InFlightTask {
    pub workflow_id: String,
    pub execution_id: String,
    pub node_id: String,
    pub started_at: DateTime<Utc>,
}

/// Removes its entry from the in-flight table when the dispatch ends,
/// including when the dispatch task panics or is aborted.
struct InFlightGuard {
    table: Arc<DashMap<String, InFlightTask>>,
    task_id: String,
}

impl InFlightGuard {
    fn track(
        table: Arc<DashMap<String, InFlightTask>>,
        workflow: &BuiltWorkflow,
        task: &TaskAssignment,
    ) -> Self {
        table.insert(
            task.task_id.clone(),
            InFlightTask {
                workflow_id: workflow.workflow_id().to_string(),
                execution_id: task.execution_id.clone(),
                node_id: task.node_id.clone(),
                started_at: Utc::now(),
            },
        );
        Self {
            table,
            task_id: task.task_id.clone(),
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.table.remove(&self.task_id);
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Polls a coordinator for tasks of its registered workflows and runs them.
///
/// A worker runs once: after [`Worker::stop`] its loop cannot be restarted.
/// Share it behind an `Arc` to call `stop()` from another task.
pub struct Worker<C: Coordinator> {
    coordinator: Arc<C>,
    config: WorkerConfig,
    worker_id: String,
    workflows: Vec<BuiltWorkflow>,
    permits: Arc<Semaphore>,
    in_flight: Arc<DashMap<String, InFlightTask>>,
    cancel: CancellationToken,
    state: watch::Sender<WorkerState>,
}

impl<C: Coordinator + 'static> Worker<C> {
    pub fn new(coordinator: Arc<C>, config: WorkerConfig) -> Self {
        let worker_id = config.resolved_worker_id();
        let permits = Arc::new(Semaphore::new(config.effective_concurrency()));
        let (state, _) = watch::channel(WorkerState::Stopped);
        Self {
            coordinator,
            config,
            worker_id,
            workflows: Vec::new(),
            permits,
            in_flight: Arc::new(DashMap::new()),
            cancel: CancellationToken::new(),
            state,
        }
    }

    /// Add a workflow. Returns `false` if the same `(workflow_id, version_hash)`
    /// is already registered. Registration order is poll order.
    pub fn register(&mut self, workflow: BuiltWorkflow) -> bool {
        let duplicate = self.workflows.iter().any(|w| {
            w.workflow_id() == workflow.workflow_id() && w.version_hash() == workflow.version_hash()
        });
        if duplicate {
            return false;
        }
        tracing::debug!(
            workflow_id = %workflow.workflow_id(),
            version_hash = %workflow.version_hash(),
            "workflow added to worker"
        );
        self.workflows.push(workflow);
        true
    }

    pub fn workflows(&self) -> &[BuiltWorkflow] {
        &self.workflows
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    /// Number of dispatches currently in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Snapshot of the in-flight dispatches keyed by task id.
    pub fn in_flight_tasks(&self) -> Vec<(String, InFlightTask)> {
        self.in_flight
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Ask the loop to stop. In-flight dispatches finish and report normally.
    pub fn stop(&self) {
        if !self.cancel.is_cancelled() {
            tracing::info!(worker_id = %self.worker_id, "stop requested");
        }
        self.cancel.cancel();
    }

    /// Register every workflow with the coordinator, in registration order.
    ///
    /// Called by [`Worker::run`]; callable earlier so executions can be
    /// started before the loop runs. Re-registering is harmless.
    pub async fn register_workflows(&self) -> Result<(), WorkerError> {
        for workflow in &self.workflows {
            let request = RegisterWorkflowRequest {
                workflow_id: workflow.workflow_id().to_string(),
                version_hash: workflow.version_hash().to_string(),
                ir_json: workflow.ir_json().to_string(),
            };
            let response = self
                .coordinator
                .register_workflow(request)
                .await
                .map_err(|source| WorkerError::Registration {
                    workflow_id: workflow.workflow_id().to_string(),
                    source,
                })?;
            if !response.ok {
                return Err(WorkerError::Registration {
                    workflow_id: workflow.workflow_id().to_string(),
                    source: CoordinatorError::Rejected(response.message),
                });
            }
            log_compatibility(workflow, &response);
        }
        Ok(())
    }

    /// Register, then poll and dispatch until [`Worker::stop`] is called.
    ///
    /// Returns after every in-flight dispatch has finished.
    pub async fn run(&self) -> Result<(), WorkerError> {
        let claimed = self.state.send_if_modified(|state| {
            if *state == WorkerState::Stopped {
                *state = WorkerState::Starting;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(WorkerError::AlreadyRunning);
        }

        tracing::info!(
            worker_id = %self.worker_id,
            workflows = self.workflows.len(),
            concurrency = self.config.effective_concurrency(),
            "worker starting"
        );
        if let Err(e) = self.register_workflows().await {
            tracing::error!(error = %e, "worker registration failed");
            self.state.send_replace(WorkerState::Stopped);
            return Err(e);
        }

        self.state.send_replace(WorkerState::Running);
        let mut dispatches = JoinSet::new();
        self.poll_loop(&mut dispatches).await;

        self.state.send_replace(WorkerState::Stopping);
        tracing::info!(
            worker_id = %self.worker_id,
            in_flight = dispatches.len(),
            "worker stopping, draining in-flight tasks"
        );
        while let Some(result) = dispatches.join_next().await {
            log_dispatch_result(result);
        }

        self.state.send_replace(WorkerState::Stopped);
        tracing::info!(worker_id = %self.worker_id, "worker stopped");
        Ok(())
    }

    async fn poll_loop(&self, dispatches: &mut JoinSet<DispatchOutcome>) {
        loop {
            while let Some(result) = dispatches.try_join_next() {
                log_dispatch_result(result);
            }

            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.claim().await {
                Ok(Some((workflow, task))) => self.spawn_dispatch(dispatches, workflow, task, permit),
                Ok(None) => {
                    drop(permit);
                    if !self.pause(self.config.poll_interval()).await {
                        break;
                    }
                }
                Err(e) => {
                    drop(permit);
                    tracing::warn!(
                        worker_id = %self.worker_id,
                        error = %e,
                        "poll failed, backing off"
                    );
                    if !self.pause(self.config.error_backoff()).await {
                        break;
                    }
                }
            }
        }
    }

    /// Poll each workflow in registration order; the first task wins.
    async fn claim(&self) -> Result<Option<(BuiltWorkflow, TaskAssignment)>, CoordinatorError> {
        for workflow in &self.workflows {
            if self.cancel.is_cancelled() {
                return Ok(None);
            }
            let request = PollTaskRequest {
                worker_id: self.worker_id.clone(),
                version_hash: workflow.version_hash().to_string(),
            };
            if let Some(task) = self.coordinator.poll_task(request).await?.into_assignment() {
                return Ok(Some((workflow.clone(), task)));
            }
        }
        Ok(None)
    }

    fn spawn_dispatch(
        &self,
        dispatches: &mut JoinSet<DispatchOutcome>,
        workflow: BuiltWorkflow,
        task: TaskAssignment,
        permit: OwnedSemaphorePermit,
    ) {
        let span = tracing::info_span!(
            "task",
            workflow_id = %workflow.workflow_id(),
            execution_id = %task.execution_id,
            node_id = %task.node_id,
            task_id = %task.task_id,
        );
        tracing::debug!(parent: &span, node_type = %task.node_type, "task claimed");

        let guard = InFlightGuard::track(Arc::clone(&self.in_flight), &workflow, &task);
        let coordinator = Arc::clone(&self.coordinator);
        dispatches.spawn(
            async move {
                let _permit = permit;
                let _guard = guard;
                dispatch::dispatch(coordinator.as_ref(), &workflow, task).await
            }
            .instrument(span),
        );
    }

    /// Sleep for `duration` unless stopped first. Returns `false` when stopped.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

impl<C: Coordinator + ExecutionControl + 'static> Worker<C> {
    /// Run the loop until `execution_id` reaches a terminal status, then stop.
    ///
    /// Returns the outputs of the execution's completed nodes.
    pub async fn run_until_complete(
        &self,
        execution_id: &str,
        timeout: Duration,
    ) -> Result<IndexMap<String, Value>, WorkerError> {
        let mut run = std::pin::pin!(self.run());
        let mut deadline = std::pin::pin!(tokio::time::sleep(timeout));
        let mut watch_status = std::pin::pin!(self.wait_for_terminal(execution_id));
        let mut run_result = None;

        // Status round-trips run as their own future so claiming continues
        // while one is in flight.
        let outcome = tokio::select! {
            result = &mut run => {
                run_result = Some(result);
                Err(WorkerError::Stopped(execution_id.to_string()))
            }
            _ = &mut deadline => Err(WorkerError::Timeout {
                execution_id: execution_id.to_string(),
                timeout,
            }),
            outcome = &mut watch_status => outcome,
        };

        self.stop();
        let run_result = match run_result {
            Some(result) => result,
            None => run.await,
        };
        run_result?;

        let snapshot = outcome?;
        match snapshot.status {
            ExecutionStatus::Completed => Ok(snapshot.completed_nodes),
            ExecutionStatus::Cancelled => Err(WorkerError::ExecutionCancelled(snapshot.execution_id)),
            ExecutionStatus::Failed | ExecutionStatus::Running => Err(WorkerError::ExecutionFailed {
                execution_id: snapshot.execution_id,
                message: snapshot.error.unwrap_or_else(|| "unknown error".to_string()),
            }),
        }
    }

    async fn wait_for_terminal(&self, execution_id: &str) -> Result<ExecutionSnapshot, WorkerError> {
        let mut ticker = tokio::time::interval(self.config.status_interval());
        loop {
            ticker.tick().await;
            match self.coordinator.get_status(execution_id).await {
                Ok(snapshot) if snapshot.status.is_terminal() => return Ok(snapshot),
                Ok(_) => {}
                Err(e) if e.is_transient() => {
                    tracing::warn!(execution_id, error = %e, "status check failed, retrying");
                }
                Err(e) => return Err(WorkerError::Status(e)),
            }
        }
    }
}

fn log_compatibility(workflow: &BuiltWorkflow, response: &RegisterWorkflowResponse) {
    let workflow_id = workflow.workflow_id();
    let version_hash = workflow.version_hash();
    match &response.compatibility {
        Compatibility::Breaking => tracing::warn!(
            workflow_id,
            version_hash,
            "breaking change detected; run old workers until in-flight executions complete"
        ),
        Compatibility::Safe => {
            tracing::info!(workflow_id, version_hash, "safe change registered, new nodes added")
        }
        Compatibility::Identical => {
            tracing::info!(workflow_id, version_hash, "workflow unchanged")
        }
        Compatibility::New => tracing::info!(workflow_id, version_hash, "new workflow registered"),
        Compatibility::Unknown(raw) => tracing::info!(
            workflow_id,
            version_hash,
            compatibility = %raw,
            "workflow registered"
        ),
    }
}

fn log_dispatch_result(result: Result<DispatchOutcome, JoinError>) {
    match result {
        Ok(outcome) => tracing::trace!(?outcome, "dispatch finished"),
        Err(e) => tracing::error!(error = %e, "dispatch task aborted"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::mock::{MockCoordinator, task};
    use crate::workflow::builder::WorkflowBuilder;
    use crate::workflow::context::{ContextError, ExecutionContext};
    use crate::workflow::contract::OutputContract;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(concurrency: usize) -> WorkerConfig {
        WorkerConfig {
            worker_id: Some("test-worker".to_string()),
            concurrency,
            poll_interval_ms: 5,
            error_backoff_ms: 5,
            status_interval_ms: 5,
            ..WorkerConfig::default()
        }
    }

    fn echo_workflow() -> BuiltWorkflow {
        WorkflowBuilder::new("echo")
            .compute("a", OutputContract::any(), |ctx: &ExecutionContext| {
                Ok::<_, ContextError>(ctx.input().clone())
            })
            .build()
            .unwrap()
    }

    /// Wait (bounded) until `cond` holds.
    async fn eventually(cond: impl Fn() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn test_register_dedupes_by_id_and_hash() {
        let mut worker = Worker::new(Arc::new(MockCoordinator::default()), config(1));
        assert!(worker.register(echo_workflow()));
        assert!(!worker.register(echo_workflow()));

        let other = WorkflowBuilder::new("other")
            .compute("a", OutputContract::any(), |_: &ExecutionContext| {
                Ok::<_, ContextError>(Value::Null)
            })
            .build()
            .unwrap();
        assert!(worker.register(other));
        let ids: Vec<&str> = worker.workflows().iter().map(|w| w.workflow_id()).collect();
        assert_eq!(ids, vec!["echo", "other"]);
        assert_eq!(worker.worker_id(), "test-worker");
    }

    #[tokio::test]
    async fn test_concurrency_bound_under_burst() {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let wf = {
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            WorkflowBuilder::new("burst")
                .effect("slow", OutputContract::any(), move |_| {
                    let current = Arc::clone(&current);
                    let peak = Arc::clone(&peak);
                    async move {
                        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        current.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, ContextError>(now)
                    }
                })
                .build()
                .unwrap()
        };

        let coord = Arc::new(MockCoordinator::default());
        for i in 0..20 {
            coord.push(task(&format!("t{i}"), "slow", ""));
        }
        let mut worker = Worker::new(Arc::clone(&coord), config(3));
        worker.register(wf);

        let (result, ()) = tokio::join!(worker.run(), async {
            eventually(|| coord.completed().len() == 20).await;
            worker.stop();
        });
        result.unwrap();

        assert!(peak.load(Ordering::SeqCst) <= 3, "peak = {}", peak.load(Ordering::SeqCst));
        assert!(peak.load(Ordering::SeqCst) >= 1);
        assert_eq!(worker.in_flight(), 0);
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn test_in_flight_tracks_running_dispatches() {
        let gate = Arc::new(Semaphore::new(0));
        let wf = {
            let gate = Arc::clone(&gate);
            WorkflowBuilder::new("blocking")
                .effect("wait", OutputContract::any(), move |_| {
                    let gate = Arc::clone(&gate);
                    async move {
                        let _pass = gate.acquire().await.unwrap();
                        Ok::<_, ContextError>(true)
                    }
                })
                .build()
                .unwrap()
        };
        let coord = Arc::new(MockCoordinator::default());
        coord.push(task("t1", "wait", ""));
        coord.push(task("t2", "wait", ""));
        let mut worker = Worker::new(Arc::clone(&coord), config(2));
        worker.register(wf);

        let (result, ()) = tokio::join!(worker.run(), async {
            eventually(|| worker.in_flight() == 2).await;
            let tasks = worker.in_flight_tasks();
            assert!(tasks.iter().all(|(_, t)| t.node_id == "wait"));
            gate.add_permits(2);
            eventually(|| worker.in_flight() == 0).await;
            worker.stop();
        });
        result.unwrap();
        assert_eq!(coord.completed().len(), 2);
    }

    #[tokio::test]
    async fn test_registration_failure_is_fatal() {
        let coord = Arc::new(MockCoordinator::default());
        coord.reject_registration();
        let mut worker = Worker::new(Arc::clone(&coord), config(1));
        worker.register(echo_workflow());

        let err = worker.run().await.unwrap_err();
        assert!(matches!(err, WorkerError::Registration { ref workflow_id, .. } if workflow_id == "echo"));
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert_eq!(coord.polls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_breaking_compatibility_does_not_stop_worker() {
        let coord = Arc::new(MockCoordinator::default());
        coord.set_compatibility(Compatibility::Breaking);
        coord.push(task("t1", "a", r#"{"input":1}"#));
        let mut worker = Worker::new(Arc::clone(&coord), config(1));
        worker.register(echo_workflow());

        let (result, ()) = tokio::join!(worker.run(), async {
            eventually(|| coord.completed().len() == 1).await;
            worker.stop();
        });
        result.unwrap();
        assert_eq!(coord.registrations().len(), 1);
        assert_eq!(coord.completed()[0].output_json, "1");
    }

    #[tokio::test]
    async fn test_poll_errors_back_off_and_recover() {
        let coord = Arc::new(MockCoordinator::default());
        coord.fail_next_polls(3);
        coord.push(task("t1", "a", r#"{"input":"ok"}"#));
        let mut worker = Worker::new(Arc::clone(&coord), config(1));
        worker.register(echo_workflow());

        let (result, ()) = tokio::join!(worker.run(), async {
            eventually(|| coord.completed().len() == 1).await;
            worker.stop();
        });
        result.unwrap();
        assert!(coord.polls.load(Ordering::SeqCst) >= 4);
    }

    #[tokio::test]
    async fn test_claiming_continues_during_status_check() {
        let coord = Arc::new(MockCoordinator::default());
        for i in 0..3 {
            coord.defer_until_status(task(&format!("t{i}"), "a", ""));
        }
        let mut worker = Worker::new(Arc::clone(&coord), config(2));
        worker.register(echo_workflow());

        // The first status check only answers after the tasks it releases
        // have been claimed and reported by the running loop.
        let outputs = tokio::time::timeout(
            Duration::from_secs(5),
            worker.run_until_complete("exec-1", Duration::from_secs(10)),
        )
        .await
        .expect("status check blocked the poll loop")
        .unwrap();
        assert!(outputs.is_empty());
        assert_eq!(coord.completed().len(), 3);
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn test_zero_status_interval_does_not_panic() {
        let coord = Arc::new(MockCoordinator::default());
        let mut worker = Worker::new(
            Arc::clone(&coord),
            WorkerConfig {
                status_interval_ms: 0,
                ..config(1)
            },
        );
        worker.register(echo_workflow());
        let outputs = worker
            .run_until_complete("exec-1", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(outputs.is_empty());
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let coord = Arc::new(MockCoordinator::default());
        let mut worker = Worker::new(Arc::clone(&coord), config(1));
        worker.register(echo_workflow());
        let mut states = worker.subscribe_state();
        assert_eq!(*states.borrow(), WorkerState::Stopped);

        let (result, seen) = tokio::join!(worker.run(), async {
            let mut seen = Vec::new();
            loop {
                states.changed().await.unwrap();
                let state = *states.borrow_and_update();
                seen.push(state);
                if state == WorkerState::Running {
                    assert!(matches!(worker.run().await, Err(WorkerError::AlreadyRunning)));
                    worker.stop();
                }
                if state == WorkerState::Stopped {
                    break seen;
                }
            }
        });
        result.unwrap();
        // Intermediate states may coalesce in a watch channel; the endpoints never do.
        assert!(seen.contains(&WorkerState::Running));
        assert_eq!(seen.last(), Some(&WorkerState::Stopped));
    }

    #[tokio::test]
    async fn test_stop_before_run_exits_after_registration() {
        let coord = Arc::new(MockCoordinator::default());
        let mut worker = Worker::new(Arc::clone(&coord), config(1));
        worker.register(echo_workflow());
        worker.stop();
        worker.run().await.unwrap();
        assert_eq!(coord.registrations().len(), 1);
        assert_eq!(coord.polls.load(Ordering::SeqCst), 0);
    }
}
