//! End-to-end runs of a real `Worker` against the in-memory coordinator.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use nexum_core::coordinator::ExecutionControl;
use nexum_core::worker::{Worker, WorkerError};
use nexum_core::workflow::builder::{SubworkflowOptions, TimerOptions};
use nexum_core::workflow::context::{ContextError, ExecutionContext};
use nexum_core::workflow::contract::{OutputContract, RouteDecision};
use nexum_core::workflow::definition::ApprovalOptions;
use nexum_core::{BuiltWorkflow, WorkflowBuilder};
use nexum_types::coordinator::{ApproveTaskRequest, ExecutionStatus, StartExecutionRequest};
use nexum_types::node::Route;
use nexum_types::worker::{WorkerConfig, WorkerState};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Value, json};

use super::{InMemoryCoordinator, ReportRecord};

const TIMEOUT: Duration = Duration::from_secs(10);

fn config() -> WorkerConfig {
    WorkerConfig {
        worker_id: Some("e2e-worker".to_string()),
        concurrency: 4,
        poll_interval_ms: 5,
        error_backoff_ms: 5,
        status_interval_ms: 5,
        ..WorkerConfig::default()
    }
}

/// A worker with `workflows` registered, plus a started execution of the first one.
async fn setup(
    coord: &Arc<InMemoryCoordinator>,
    workflows: Vec<BuiltWorkflow>,
    input: Value,
) -> (Worker<InMemoryCoordinator>, String) {
    let target = workflows[0].workflow_id().to_string();
    let mut worker = Worker::new(Arc::clone(coord), config());
    for wf in workflows {
        worker.register(wf);
    }
    worker.register_workflows().await.unwrap();
    let execution_id = coord
        .start_execution(StartExecutionRequest {
            workflow_id: target,
            version_hash: None,
            input,
        })
        .await
        .unwrap();
    (worker, execution_id)
}

fn completions<'a>(reports: &'a [ReportRecord], node_id: &str) -> Vec<&'a ReportRecord> {
    reports
        .iter()
        .filter(|r| r.node_id() == node_id && matches!(r, ReportRecord::Completed { .. }))
        .collect()
}

#[tokio::test]
async fn sequential_chain_sees_all_previous_nodes() {
    let wf = WorkflowBuilder::new("chain")
        .compute("a", OutputContract::any(), |ctx: &ExecutionContext| {
            Ok::<_, ContextError>(ctx.input()["n"].as_i64().unwrap_or(0) + 1)
        })
        .compute("b", OutputContract::any(), |ctx: &ExecutionContext| {
            Ok::<_, ContextError>(ctx.get_as::<i64>("a")? * 10)
        })
        .compute("c", OutputContract::any(), |ctx: &ExecutionContext| {
            let deps: Vec<String> = ctx.dependencies().map(str::to_string).collect();
            Ok::<_, ContextError>(json!({ "deps": deps, "b": ctx.get("b")? }))
        })
        .build()
        .unwrap();
    assert_eq!(wf.node("c").unwrap().dependencies, vec!["a", "b"]);

    let coord = Arc::new(InMemoryCoordinator::new());
    let (worker, exec) = setup(&coord, vec![wf], json!({"n": 4})).await;
    let outputs = worker.run_until_complete(&exec, TIMEOUT).await.unwrap();

    assert_eq!(outputs["a"], json!(5));
    assert_eq!(outputs["b"], json!(50));
    assert_eq!(outputs["c"], json!({"deps": ["a", "b"], "b": 50}));
    assert_eq!(worker.state(), WorkerState::Stopped);
}

#[tokio::test]
async fn merge_waits_for_both_independent_branches() {
    let order = Arc::new(Mutex::new(Vec::<String>::new()));
    let record = |name: &'static str, delay_ms: u64| {
        let order = Arc::clone(&order);
        move |_: ExecutionContext| {
            let order = Arc::clone(&order);
            async move {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                order.lock().unwrap().push(name.to_string());
                Ok::<_, ContextError>(name)
            }
        }
    };

    let wf = WorkflowBuilder::new("fan-in")
        .effect_after("x", Vec::<String>::new(), OutputContract::any(), record("x", 60))
        .effect_after("y", Vec::<String>::new(), OutputContract::any(), record("y", 5))
        .effect_after("merge", ["x", "y"], OutputContract::any(), {
            let order = Arc::clone(&order);
            move |ctx: ExecutionContext| {
                let order = Arc::clone(&order);
                async move {
                    let x: String = ctx.get_as("x")?;
                    let y: String = ctx.get_as("y")?;
                    order.lock().unwrap().push("merge".to_string());
                    Ok::<_, ContextError>(format!("{x}+{y}"))
                }
            }
        })
        .build()
        .unwrap();

    let coord = Arc::new(InMemoryCoordinator::new());
    let (worker, exec) = setup(&coord, vec![wf], Value::Null).await;
    let outputs = worker.run_until_complete(&exec, TIMEOUT).await.unwrap();

    assert_eq!(outputs["merge"], json!("x+y"));
    let order = order.lock().unwrap().clone();
    assert_eq!(order.last().map(String::as_str), Some("merge"));
    // y finished first even though x was declared first.
    assert_eq!(order, vec!["y", "x", "merge"]);
}

#[tokio::test]
async fn map_then_reduce_reports_each_phase() {
    let wf = WorkflowBuilder::new("squares")
        .map(
            "p",
            OutputContract::any(),
            |ctx: &ExecutionContext| -> Result<Vec<Value>, ContextError> {
                Ok(ctx.input()["items"].as_array().cloned().unwrap_or_default())
            },
            |_, item: Value, index: usize| async move {
                let n = item.as_i64().unwrap_or(0);
                Ok::<_, ContextError>(json!({ "index": index, "square": n * n }))
            },
        )
        .reduce("r", OutputContract::any(), |ctx: ExecutionContext| async move {
            let total: i64 = ctx
                .get_map_results("p")?
                .iter()
                .map(|r| r["square"].as_i64().unwrap_or(0))
                .sum();
            Ok::<_, ContextError>(total)
        })
        .build()
        .unwrap();

    let coord = Arc::new(InMemoryCoordinator::new());
    let (worker, exec) = setup(&coord, vec![wf], json!({"items": [1, 2, 3]})).await;
    let outputs = worker.run_until_complete(&exec, TIMEOUT).await.unwrap();

    assert_eq!(outputs["r"], json!(14));
    assert_eq!(
        outputs["p"],
        json!([
            {"index": 0, "square": 1},
            {"index": 1, "square": 4},
            {"index": 2, "square": 9}
        ])
    );

    let reports = coord.reports();
    let map_reports = completions(&reports, "p");
    assert_eq!(map_reports.len(), 4);
    assert_eq!(map_reports.iter().filter(|r| !r.is_map_item()).count(), 1);
    assert_eq!(map_reports.iter().filter(|r| r.is_map_item()).count(), 3);
    assert_eq!(completions(&reports, "r").len(), 1);
}

#[tokio::test]
async fn approval_is_claimed_but_never_reported() {
    let wf = WorkflowBuilder::new("expense")
        .compute("prepare", OutputContract::any(), |_: &ExecutionContext| {
            Ok::<_, ContextError>(json!({"amount": 120}))
        })
        .human_approval(
            "sign-off",
            ApprovalOptions {
                approvers: vec!["dana".to_string()],
                message: Some("approve the expense".to_string()),
            },
        )
        .compute("pay", OutputContract::any(), |ctx: &ExecutionContext| {
            Ok::<_, ContextError>(ctx.get("sign-off")?["approver"].clone())
        })
        .build()
        .unwrap();

    let coord = Arc::new(InMemoryCoordinator::new());
    let (worker, exec) = setup(&coord, vec![wf], Value::Null).await;

    let approve = async {
        loop {
            let pending = coord.get_pending_approvals(Some("expense")).await.unwrap();
            if !pending.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // Let the dispatch settle; it must not report anything.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(coord.reports().iter().all(|r| r.node_id() != "sign-off"));
        assert_eq!(worker.in_flight(), 0);

        coord
            .approve_task(ApproveTaskRequest {
                execution_id: exec.clone(),
                node_id: "sign-off".to_string(),
                approver: "dana".to_string(),
                comment: String::new(),
            })
            .await
            .unwrap();
    };

    let (outputs, ()) = tokio::join!(worker.run_until_complete(&exec, TIMEOUT), approve);
    let outputs = outputs.unwrap();
    assert_eq!(outputs["pay"], json!("dana"));
    assert!(coord.reports().iter().all(|r| r.node_id() != "sign-off"));
}

#[derive(Debug, Deserialize, JsonSchema)]
struct Invoice {
    #[allow(dead_code)]
    total: f64,
}

#[tokio::test]
async fn contract_violation_fails_the_execution() {
    let wf = WorkflowBuilder::new("billing")
        .compute("invoice", OutputContract::of::<Invoice>(), |_: &ExecutionContext| {
            Ok::<_, ContextError>(json!({"total": "not a number"}))
        })
        .build()
        .unwrap();

    let coord = Arc::new(InMemoryCoordinator::new());
    let (worker, exec) = setup(&coord, vec![wf], Value::Null).await;
    let err = worker.run_until_complete(&exec, TIMEOUT).await.unwrap_err();

    match err {
        WorkerError::ExecutionFailed { execution_id, message } => {
            assert_eq!(execution_id, exec);
            assert!(message.contains("invoice"), "{message}");
            assert!(message.contains("violates contract"), "{message}");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn router_timer_and_subworkflow_run_to_completion() {
    let child = WorkflowBuilder::new("notify")
        .compute("send", OutputContract::any(), |ctx: &ExecutionContext| {
            Ok::<_, ContextError>(format!("sent to {}", ctx.input()["to"].as_str().unwrap_or("?")))
        })
        .build()
        .unwrap();

    let parent = WorkflowBuilder::new("onboarding")
        .router(
            "tier",
            vec![Route::new("vip", "concierge"), Route::new("default", "standard")],
            |ctx: &ExecutionContext| {
                let vip = ctx.input()["vip"].as_bool().unwrap_or(false);
                Ok::<_, ContextError>(RouteDecision::to(if vip { "concierge" } else { "standard" }))
            },
        )
        .compute_after("concierge", ["tier"], OutputContract::any(), |_: &ExecutionContext| {
            Ok::<_, ContextError>("white glove")
        })
        .compute_after("standard", ["tier"], OutputContract::any(), |_: &ExecutionContext| {
            Ok::<_, ContextError>("self serve")
        })
        .timer("cool-off", TimerOptions::Delay(0))
        .subworkflow(
            "welcome",
            OutputContract::any(),
            SubworkflowOptions::for_workflow(&child, |ctx: &ExecutionContext| {
                Ok::<_, ContextError>(json!({ "to": ctx.input()["email"].clone() }))
            }),
        )
        .build()
        .unwrap();

    let coord = Arc::new(InMemoryCoordinator::new());
    let (worker, exec) = setup(
        &coord,
        vec![parent, child],
        json!({"vip": false, "email": "kim@example.com"}),
    )
    .await;
    let outputs = worker.run_until_complete(&exec, TIMEOUT).await.unwrap();

    assert_eq!(outputs["tier"], json!({"routed_to": "standard"}));
    assert_eq!(outputs["standard"], json!("self serve"));
    assert!(!outputs.contains_key("concierge"));
    assert_eq!(outputs["cool-off"]["delay_seconds"], json!(0));
    assert_eq!(outputs["welcome"], json!("sent to kim@example.com"));

    let children = coord.child_executions(&exec);
    assert_eq!(children.len(), 1);
    let child_status = coord.get_status(&children[0]).await.unwrap();
    assert_eq!(child_status.status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn run_until_complete_times_out() {
    let wf = WorkflowBuilder::new("slow")
        .timer("forever", TimerOptions::Delay(3600))
        .build()
        .unwrap();

    let coord = Arc::new(InMemoryCoordinator::new());
    let (worker, exec) = setup(&coord, vec![wf], Value::Null).await;
    let err = worker
        .run_until_complete(&exec, Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, WorkerError::Timeout { .. }));
    assert_eq!(worker.state(), WorkerState::Stopped);
}

#[tokio::test]
async fn zero_status_interval_still_tracks_completion() {
    let wf = WorkflowBuilder::new("tight")
        .compute("only", OutputContract::any(), |_: &ExecutionContext| {
            Ok::<_, ContextError>(json!("done"))
        })
        .build()
        .unwrap();

    let coord = Arc::new(InMemoryCoordinator::new());
    let mut worker = Worker::new(
        Arc::clone(&coord),
        WorkerConfig {
            status_interval_ms: 0,
            ..config()
        },
    );
    worker.register(wf);
    worker.register_workflows().await.unwrap();
    let exec = coord
        .start_execution(StartExecutionRequest {
            workflow_id: "tight".to_string(),
            version_hash: None,
            input: Value::Null,
        })
        .await
        .unwrap();

    let outputs = worker.run_until_complete(&exec, TIMEOUT).await.unwrap();
    assert_eq!(outputs["only"], json!("done"));
}
