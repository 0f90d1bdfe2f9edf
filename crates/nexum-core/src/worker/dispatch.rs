//! Per-task dispatch: the local half of each node kind's protocol.
//!
//! A claimed task is resolved into exactly one coordinator report:
//!
//! | Task                         | Local action                          | Report         |
//! |------------------------------|---------------------------------------|----------------|
//! | HUMAN_APPROVAL               | none, resolved out of band            | none           |
//! | SUBWORKFLOW                  | evaluate the child input mapping      | `complete`     |
//! | MAP (phase 1)                | evaluate the item list                | `complete`     |
//! | MAP sub-task (phase 2)       | per-item handler + contract check     | `complete`     |
//! | COMPUTE / EFFECT / ROUTER / REDUCE | handler + contract check        | `complete`     |
//! | anything that fails above    |                                       | `fail`         |
//!
//! Every failure, including a panicking handler, ends in a `fail_task` report
//! and never escapes to the poll loop.

use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;
use nexum_types::coordinator::{CompleteTaskRequest, FailTaskRequest};
use nexum_types::node::NodeKind;
use nexum_types::task::TaskAssignment;
use serde_json::Value;

use crate::coordinator::Coordinator;
use crate::workflow::context::ExecutionContext;
use crate::workflow::definition::{BuiltWorkflow, DispatchError};

/// How a dispatched task ended, from the worker's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Output reported through `complete_task`.
    Completed,
    /// Failure reported through `fail_task` with this message.
    Failed(String),
    /// Human approval pending; nothing was reported.
    AwaitingApproval,
}

/// Local result of a task before it is reported.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Complete(Value),
    AwaitApproval,
}

/// Run the local protocol for `task` and report the result to `coordinator`.
///
/// Reporting errors are logged; they do not change the returned outcome.
pub async fn dispatch<C: Coordinator + ?Sized>(
    coordinator: &C,
    workflow: &BuiltWorkflow,
    task: TaskAssignment,
) -> DispatchOutcome {
    let resolution = match AssertUnwindSafe(resolve(workflow, &task)).catch_unwind().await {
        Ok(resolution) => resolution.map_err(|e| e.to_string()),
        Err(panic) => Err(format!(
            "handler for node '{}' panicked: {}",
            task.node_id,
            panic_message(&*panic)
        )),
    };

    match resolution {
        Ok(Resolution::AwaitApproval) => {
            tracing::info!(
                node_id = %task.node_id,
                execution_id = %task.execution_id,
                "waiting for human approval"
            );
            DispatchOutcome::AwaitingApproval
        }
        Ok(Resolution::Complete(output)) => {
            report_complete(coordinator, &task, &output).await;
            DispatchOutcome::Completed
        }
        Err(message) => {
            tracing::warn!(node_id = %task.node_id, error = %message, "task failed");
            report_fail(coordinator, &task, &message).await;
            DispatchOutcome::Failed(message)
        }
    }
}

/// Execute the local protocol for `task` without reporting.
pub async fn resolve(
    workflow: &BuiltWorkflow,
    task: &TaskAssignment,
) -> Result<Resolution, DispatchError> {
    let node = workflow
        .node(&task.node_id)
        .ok_or_else(|| DispatchError::UnknownNode(task.node_id.clone()))?;

    if node.kind() == NodeKind::HumanApproval {
        return Ok(Resolution::AwaitApproval);
    }

    let input = task.decode_input().map_err(|source| DispatchError::Input {
        node_id: node.id.clone(),
        source,
    })?;
    let ctx = ExecutionContext::from_task(task, input, workflow.dependency_kinds(node));

    if task.is_map_subtask() {
        let item = task.decode_map_item().map_err(|source| DispatchError::Input {
            node_id: node.id.clone(),
            source,
        })?;
        tracing::debug!(
            node_id = %node.id,
            index = task.map_index,
            total = task.map_total,
            "running map item"
        );
        let output = node.invoke_item(ctx, item, task.map_index as usize).await?;
        node.validate(&output)?;
        return Ok(Resolution::Complete(output));
    }

    let output = match node.kind() {
        NodeKind::Subworkflow => {
            let request = node.subworkflow_request(&ctx)?;
            tracing::info!(node_id = %node.id, "starting subworkflow, parent waiting");
            request
        }
        NodeKind::Map => {
            let items = node.items(&ctx)?;
            tracing::info!(node_id = %node.id, items = items.len(), "starting map");
            Value::Array(items)
        }
        _ => {
            let output = node.invoke(ctx).await?;
            node.validate(&output)?;
            output
        }
    };
    Ok(Resolution::Complete(output))
}

async fn report_complete<C: Coordinator + ?Sized>(coordinator: &C, task: &TaskAssignment, output: &Value) {
    let request = CompleteTaskRequest {
        task_id: task.task_id.clone(),
        output_json: output.to_string(),
    };
    match coordinator.complete_task(request).await {
        Ok(ack) if !ack.ok => {
            tracing::warn!(task_id = %task.task_id, message = %ack.message, "completion not acknowledged");
        }
        Ok(_) => {
            tracing::debug!(task_id = %task.task_id, node_id = %task.node_id, "task completed");
        }
        Err(e) => {
            tracing::error!(task_id = %task.task_id, error = %e, "failed to report task completion");
        }
    }
}

async fn report_fail<C: Coordinator + ?Sized>(coordinator: &C, task: &TaskAssignment, message: &str) {
    let request = FailTaskRequest {
        task_id: task.task_id.clone(),
        error_message: message.to_string(),
    };
    match coordinator.fail_task(request).await {
        Ok(ack) if !ack.ok => {
            tracing::warn!(task_id = %task.task_id, message = %ack.message, "failure not acknowledged");
        }
        Ok(_) => {}
        Err(e) => {
            tracing::error!(task_id = %task.task_id, error = %e, "failed to report task failure");
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}
