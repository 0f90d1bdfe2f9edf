//! Fluent workflow builder.
//!
//! Nodes are declared in order; a node declared without explicit
//! dependencies depends on every node declared before it. The `_after`
//! variants take an explicit dependency list instead, which is how fan-out
//! and fan-in graphs are expressed.
//!
//! Declaration errors (duplicate ids, a reduce with no map) are recorded and
//! surfaced by [`WorkflowBuilder::build`], together with graph errors found
//! by DAG validation.
//!
//! ```no_run
//! use nexum_core::workflow::builder::WorkflowBuilder;
//! use nexum_core::workflow::contract::OutputContract;
//! use nexum_core::workflow::context::ContextError;
//!
//! let workflow = WorkflowBuilder::new("greet")
//!     .compute("name", OutputContract::any(), |ctx| {
//!         Ok::<_, ContextError>(ctx.input()["name"].clone())
//!     })
//!     .compute("greeting", OutputContract::any(), |ctx| {
//!         let name = ctx.get_as::<String>("name")?;
//!         Ok::<_, ContextError>(format!("hello, {name}"))
//!     })
//!     .build()
//!     .unwrap();
//! assert!(workflow.version_hash().starts_with("sha256:"));
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use indexmap::IndexMap;
use nexum_types::ir::WorkflowIr;
use nexum_types::node::{NodeKind, Route};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::context::ExecutionContext;
use super::contract::{ApprovalOutcome, OutputContract, RouteDecision, TimerOutcome};
use super::dag::validate_dag;
use super::definition::{
    ApprovalOptions, AsyncHandler, BuildError, BuiltWorkflow, HandlerError, HandlerResult,
    ItemHandler, ItemsFn, NodeBehavior, NodeDefinition, SyncHandler,
};
use super::hash::version_hash;

// ---------------------------------------------------------------------------
// Options for coordinator-resolved nodes
// ---------------------------------------------------------------------------

/// Target and input mapping of a subworkflow node.
#[derive(Clone)]
pub struct SubworkflowOptions {
    workflow_id: String,
    input: SyncHandler,
    input_signature: Option<String>,
}

impl SubworkflowOptions {
    /// Run `workflow_id` with the input produced by `input`.
    pub fn new<F, R, E>(workflow_id: impl Into<String>, input: F) -> Self
    where
        F: Fn(&ExecutionContext) -> Result<R, E> + Send + Sync + 'static,
        R: Serialize,
        E: fmt::Display,
    {
        Self {
            workflow_id: workflow_id.into(),
            input: sync_handler(input),
            input_signature: None,
        }
    }

    /// Run an already built workflow as the child.
    pub fn for_workflow<F, R, E>(workflow: &BuiltWorkflow, input: F) -> Self
    where
        F: Fn(&ExecutionContext) -> Result<R, E> + Send + Sync + 'static,
        R: Serialize,
        E: fmt::Display,
    {
        Self::new(workflow.workflow_id(), input)
    }

    /// Describe the input mapping in the IR (`inputFn`). Changing the
    /// signature changes the version hash; the closure itself never does.
    pub fn with_input_signature(mut self, signature: impl Into<String>) -> Self {
        self.input_signature = Some(signature.into());
        self
    }
}

impl fmt::Debug for SubworkflowOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubworkflowOptions")
            .field("workflow_id", &self.workflow_id)
            .field("input_signature", &self.input_signature)
            .finish_non_exhaustive()
    }
}

/// When a timer node fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerOptions {
    /// Fixed delay in seconds after the timer node becomes ready.
    Delay(u64),
    /// Absolute time, converted to a delay from the moment of declaration.
    ///
    /// The delay is part of the IR, so the version hash changes with the
    /// declaration time: two processes declaring the same workflow a second
    /// apart register different versions. Use [`TimerOptions::Delay`] when
    /// workers must agree on one version.
    At(DateTime<Utc>),
}

impl TimerOptions {
    /// Delay in whole seconds relative to `now`. Past instants clamp to 0.
    pub fn delay_seconds(&self, now: DateTime<Utc>) -> u64 {
        match self {
            TimerOptions::Delay(seconds) => *seconds,
            TimerOptions::At(at) => u64::try_from((*at - now).num_seconds()).unwrap_or(0),
        }
    }
}

// ---------------------------------------------------------------------------
// Handler adapters
// ---------------------------------------------------------------------------

fn to_output<R: Serialize>(result: R) -> HandlerResult {
    serde_json::to_value(result).map_err(HandlerError::from_display)
}

fn sync_handler<F, R, E>(f: F) -> SyncHandler
where
    F: Fn(&ExecutionContext) -> Result<R, E> + Send + Sync + 'static,
    R: Serialize,
    E: fmt::Display,
{
    Arc::new(move |ctx: &ExecutionContext| {
        f(ctx)
            .map_err(HandlerError::from_display)
            .and_then(to_output)
    })
}

fn async_handler<F, Fut, R, E>(f: F) -> AsyncHandler
where
    F: Fn(ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
    R: Serialize + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    Arc::new(move |ctx: ExecutionContext| -> BoxFuture<'static, HandlerResult> {
        let fut = f(ctx);
        async move {
            fut.await
                .map_err(HandlerError::from_display)
                .and_then(to_output)
        }
        .boxed()
    })
}

fn items_fn<F, T, E>(f: F) -> ItemsFn
where
    F: Fn(&ExecutionContext) -> Result<Vec<T>, E> + Send + Sync + 'static,
    T: Serialize,
    E: fmt::Display,
{
    Arc::new(move |ctx: &ExecutionContext| -> Result<Vec<Value>, HandlerError> {
        f(ctx)
            .map_err(HandlerError::from_display)?
            .into_iter()
            .map(to_output)
            .collect()
    })
}

fn item_handler<F, Fut, R, E>(f: F) -> ItemHandler
where
    F: Fn(ExecutionContext, Value, usize) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
    R: Serialize + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    Arc::new(
        move |ctx: ExecutionContext, item: Value, index: usize| -> BoxFuture<'static, HandlerResult> {
            let fut = f(ctx, item, index);
            async move {
                fut.await
                    .map_err(HandlerError::from_display)
                    .and_then(to_output)
            }
            .boxed()
        },
    )
}

fn ids<I, S>(ids: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    ids.into_iter().map(Into::into).collect()
}

// ---------------------------------------------------------------------------
// WorkflowBuilder
// ---------------------------------------------------------------------------

/// Accumulates node declarations and compiles them into a [`BuiltWorkflow`].
pub struct WorkflowBuilder {
    workflow_id: String,
    nodes: Vec<NodeDefinition>,
    errors: Vec<BuildError>,
}

impl WorkflowBuilder {
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            nodes: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Pure synchronous step depending on every previously declared node.
    pub fn compute<F, R, E>(self, id: impl Into<String>, contract: OutputContract, handler: F) -> Self
    where
        F: Fn(&ExecutionContext) -> Result<R, E> + Send + Sync + 'static,
        R: Serialize,
        E: fmt::Display,
    {
        let behavior = NodeBehavior::Compute {
            handler: sync_handler(handler),
        };
        self.declare(id.into(), None, contract, behavior)
    }

    /// Pure synchronous step with explicit dependencies.
    pub fn compute_after<I, S, F, R, E>(
        self,
        id: impl Into<String>,
        dependencies: I,
        contract: OutputContract,
        handler: F,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&ExecutionContext) -> Result<R, E> + Send + Sync + 'static,
        R: Serialize,
        E: fmt::Display,
    {
        let behavior = NodeBehavior::Compute {
            handler: sync_handler(handler),
        };
        self.declare(id.into(), Some(ids(dependencies)), contract, behavior)
    }

    /// Side-effecting asynchronous step depending on every previously declared node.
    pub fn effect<F, Fut, R, E>(
        self,
        id: impl Into<String>,
        contract: OutputContract,
        handler: F,
    ) -> Self
    where
        F: Fn(ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
        R: Serialize + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let behavior = NodeBehavior::Effect {
            handler: async_handler(handler),
        };
        self.declare(id.into(), None, contract, behavior)
    }

    /// Side-effecting asynchronous step with explicit dependencies.
    pub fn effect_after<I, S, F, Fut, R, E>(
        self,
        id: impl Into<String>,
        dependencies: I,
        contract: OutputContract,
        handler: F,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
        R: Serialize + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let behavior = NodeBehavior::Effect {
            handler: async_handler(handler),
        };
        self.declare(id.into(), Some(ids(dependencies)), contract, behavior)
    }

    /// Branch selection. The handler names the taken route target; the
    /// coordinator skips the others.
    pub fn router<F, E>(self, id: impl Into<String>, routes: Vec<Route>, handler: F) -> Self
    where
        F: Fn(&ExecutionContext) -> Result<RouteDecision, E> + Send + Sync + 'static,
        E: fmt::Display,
    {
        let behavior = NodeBehavior::Router {
            routes,
            handler: sync_handler(handler),
        };
        self.declare(id.into(), None, OutputContract::of::<RouteDecision>(), behavior)
    }

    pub fn router_after<I, S, F, E>(
        self,
        id: impl Into<String>,
        dependencies: I,
        routes: Vec<Route>,
        handler: F,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&ExecutionContext) -> Result<RouteDecision, E> + Send + Sync + 'static,
        E: fmt::Display,
    {
        let behavior = NodeBehavior::Router {
            routes,
            handler: sync_handler(handler),
        };
        self.declare(
            id.into(),
            Some(ids(dependencies)),
            OutputContract::of::<RouteDecision>(),
            behavior,
        )
    }

    /// Pause until a human approves or rejects through the coordinator.
    pub fn human_approval(self, id: impl Into<String>, options: ApprovalOptions) -> Self {
        let behavior = NodeBehavior::HumanApproval { options };
        self.declare(id.into(), None, OutputContract::of::<ApprovalOutcome>(), behavior)
    }

    /// Fan out over the list produced by `items`, running `handler` once per
    /// item. `contract` applies to each per-item result.
    pub fn map<IF, T, EI, F, Fut, R, E>(
        self,
        id: impl Into<String>,
        contract: OutputContract,
        items: IF,
        handler: F,
    ) -> Self
    where
        IF: Fn(&ExecutionContext) -> Result<Vec<T>, EI> + Send + Sync + 'static,
        T: Serialize,
        EI: fmt::Display,
        F: Fn(ExecutionContext, Value, usize) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
        R: Serialize + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let behavior = NodeBehavior::Map {
            items: items_fn(items),
            handler: item_handler(handler),
        };
        self.declare(id.into(), None, contract, behavior)
    }

    /// Aggregate the results of the most recently declared map.
    pub fn reduce<F, Fut, R, E>(
        mut self,
        id: impl Into<String>,
        contract: OutputContract,
        handler: F,
    ) -> Self
    where
        F: Fn(ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
        R: Serialize + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let id = id.into();
        let Some(map_node_id) = self
            .nodes
            .iter()
            .rev()
            .find(|n| n.kind() == NodeKind::Map)
            .map(|n| n.id.clone())
        else {
            self.errors.push(BuildError::ReduceWithoutMap(id));
            return self;
        };
        let behavior = NodeBehavior::Reduce {
            map_node_id: map_node_id.clone(),
            handler: async_handler(handler),
        };
        self.declare(id, Some(vec![map_node_id]), contract, behavior)
    }

    /// Launch and await another workflow.
    pub fn subworkflow(
        self,
        id: impl Into<String>,
        contract: OutputContract,
        options: SubworkflowOptions,
    ) -> Self {
        let behavior = NodeBehavior::Subworkflow {
            workflow_id: options.workflow_id,
            input: options.input,
            input_signature: options.input_signature,
        };
        self.declare(id.into(), None, contract, behavior)
    }

    /// Wait before proceeding. Resolved entirely by the coordinator.
    pub fn timer(self, id: impl Into<String>, options: TimerOptions) -> Self {
        let behavior = NodeBehavior::Timer {
            delay_seconds: options.delay_seconds(Utc::now()),
        };
        self.declare(id.into(), None, OutputContract::of::<TimerOutcome>(), behavior)
    }

    fn declare(
        mut self,
        id: String,
        dependencies: Option<Vec<String>>,
        contract: OutputContract,
        behavior: NodeBehavior,
    ) -> Self {
        if self.nodes.iter().any(|n| n.id == id) {
            self.errors.push(BuildError::DuplicateNode(id));
            return self;
        }
        let dependencies =
            dependencies.unwrap_or_else(|| self.nodes.iter().map(|n| n.id.clone()).collect());
        self.nodes.push(NodeDefinition {
            id,
            dependencies,
            contract,
            behavior,
        });
        self
    }

    /// Compile the declared nodes.
    ///
    /// Deterministic and repeatable: building twice yields the same IR and hash.
    pub fn build(&self) -> Result<BuiltWorkflow, BuildError> {
        if let Some(err) = self.errors.first() {
            return Err(err.clone());
        }
        if self.workflow_id.trim().is_empty() {
            return Err(BuildError::EmptyWorkflowId);
        }

        let mut ir = WorkflowIr::new();
        for node in &self.nodes {
            ir.nodes.insert(node.id.clone(), node.to_ir());
        }
        validate_dag(&ir)?;

        for node in &self.nodes {
            if let NodeBehavior::Router { routes, .. } = &node.behavior {
                if let Some(route) = routes.iter().find(|r| !ir.contains(&r.target)) {
                    return Err(BuildError::UnknownRouteTarget {
                        node_id: node.id.clone(),
                        target: route.target.clone(),
                    });
                }
            }
        }

        let ir_json = ir
            .to_canonical_json()
            .map_err(|e| BuildError::Serialize(e.to_string()))?;
        let version_hash = version_hash(&ir_json);
        let handlers: IndexMap<String, NodeDefinition> = self
            .nodes
            .iter()
            .map(|n| (n.id.clone(), n.clone()))
            .collect();

        debug!(
            workflow_id = %self.workflow_id,
            version_hash = %version_hash,
            nodes = handlers.len(),
            "built workflow"
        );

        Ok(BuiltWorkflow::new(
            self.workflow_id.clone(),
            version_hash,
            ir_json,
            ir,
            handlers,
        ))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
