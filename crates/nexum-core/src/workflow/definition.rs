//! Node definitions, the compiled workflow, and workflow error types.
//!
//! The serializable IR and the runtime handlers are kept apart: a
//! [`NodeDefinition`] renders to an [`IrNode`] (structure only, hashed) and
//! separately carries its [`NodeBehavior`] (closures, never transmitted).

use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use indexmap::IndexMap;
use nexum_types::ir::{IrNode, WorkflowIr};
use nexum_types::node::{NodeKind, Route};
use serde_json::Value;
use thiserror::Error;

use super::context::{ContextError, ExecutionContext};
use super::contract::{ContractViolation, OutputContract};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors detected while compiling a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("workflow id must not be empty")]
    EmptyWorkflowId,

    #[error("duplicate node id: '{0}'")]
    DuplicateNode(String),

    #[error("reduce node '{0}' has no preceding map node")]
    ReduceWithoutMap(String),

    #[error("node '{node_id}' depends on unknown node '{dependency}'")]
    UnknownDependency { node_id: String, dependency: String },

    #[error("router '{node_id}' routes to unknown node '{target}'")]
    UnknownRouteTarget { node_id: String, target: String },

    #[error("cycle detected involving node '{0}'")]
    CycleDetected(String),

    #[error("failed to serialize IR: {0}")]
    Serialize(String),
}

/// Failure raised by a user handler. Any `Display` error converts into one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Convert any displayable error, keeping its message.
    pub fn from_display(err: impl fmt::Display) -> Self {
        Self::new(err.to_string())
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<ContextError> for HandlerError {
    fn from(err: ContextError) -> Self {
        Self::from_display(err)
    }
}

/// Errors raised while executing the local half of a node's protocol.
///
/// The worker turns every one of these into a `fail_task` report.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no handler for node: {0}")]
    UnknownNode(String),

    #[error("node '{node_id}' ({kind}) is handled by coordinator and must not be invoked locally")]
    HandledByCoordinator { node_id: String, kind: NodeKind },

    #[error("protocol mismatch for node '{node_id}': {detail}")]
    ProtocolMismatch { node_id: String, detail: String },

    #[error("invalid task input for node '{node_id}': {source}")]
    Input {
        node_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("handler for node '{node_id}' failed: {source}")]
    Handler {
        node_id: String,
        #[source]
        source: HandlerError,
    },

    #[error(transparent)]
    Contract(#[from] ContractViolation),
}

// ---------------------------------------------------------------------------
// Handler types
// ---------------------------------------------------------------------------

pub type HandlerResult = Result<Value, HandlerError>;

/// Synchronous handler (compute, router, subworkflow input mapping).
pub type SyncHandler = Arc<dyn Fn(&ExecutionContext) -> HandlerResult + Send + Sync>;

/// Asynchronous handler taking an owned context (effect, reduce).
pub type AsyncHandler =
    Arc<dyn Fn(ExecutionContext) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Produces the item list a map fans out over.
pub type ItemsFn = Arc<dyn Fn(&ExecutionContext) -> Result<Vec<Value>, HandlerError> + Send + Sync>;

/// Per-item map handler: `(context, item, index)`.
pub type ItemHandler =
    Arc<dyn Fn(ExecutionContext, Value, usize) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Runtime-only metadata for a human-approval node. Not part of the IR.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApprovalOptions {
    pub approvers: Vec<String>,
    pub message: Option<String>,
}

/// Kind-specific fields and handlers of a node.
#[derive(Clone)]
pub enum NodeBehavior {
    Compute {
        handler: SyncHandler,
    },
    Effect {
        handler: AsyncHandler,
    },
    Router {
        routes: Vec<Route>,
        handler: SyncHandler,
    },
    HumanApproval {
        options: ApprovalOptions,
    },
    Map {
        items: ItemsFn,
        handler: ItemHandler,
    },
    Reduce {
        map_node_id: String,
        handler: AsyncHandler,
    },
    Subworkflow {
        workflow_id: String,
        input: SyncHandler,
        input_signature: Option<String>,
    },
    Timer {
        delay_seconds: u64,
    },
}

impl NodeBehavior {
    pub fn kind(&self) -> NodeKind {
        match self {
            NodeBehavior::Compute { .. } => NodeKind::Compute,
            NodeBehavior::Effect { .. } => NodeKind::Effect,
            NodeBehavior::Router { .. } => NodeKind::Router,
            NodeBehavior::HumanApproval { .. } => NodeKind::HumanApproval,
            NodeBehavior::Map { .. } => NodeKind::Map,
            NodeBehavior::Reduce { .. } => NodeKind::Reduce,
            NodeBehavior::Subworkflow { .. } => NodeKind::Subworkflow,
            NodeBehavior::Timer { .. } => NodeKind::Timer,
        }
    }
}

impl fmt::Debug for NodeBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeBehavior::Router { routes, .. } => {
                f.debug_struct("Router").field("routes", routes).finish_non_exhaustive()
            }
            NodeBehavior::HumanApproval { options } => f
                .debug_struct("HumanApproval")
                .field("options", options)
                .finish(),
            NodeBehavior::Reduce { map_node_id, .. } => f
                .debug_struct("Reduce")
                .field("map_node_id", map_node_id)
                .finish_non_exhaustive(),
            NodeBehavior::Subworkflow {
                workflow_id,
                input_signature,
                ..
            } => f
                .debug_struct("Subworkflow")
                .field("workflow_id", workflow_id)
                .field("input_signature", input_signature)
                .finish_non_exhaustive(),
            NodeBehavior::Timer { delay_seconds } => f
                .debug_struct("Timer")
                .field("delay_seconds", delay_seconds)
                .finish(),
            other => write!(f, "{}", other.kind()),
        }
    }
}

// ---------------------------------------------------------------------------
// NodeDefinition
// ---------------------------------------------------------------------------

/// One declared node: structure plus runtime behavior.
#[derive(Debug, Clone)]
pub struct NodeDefinition {
    pub id: String,
    pub dependencies: Vec<String>,
    pub contract: OutputContract,
    pub behavior: NodeBehavior,
}

impl NodeDefinition {
    pub fn kind(&self) -> NodeKind {
        self.behavior.kind()
    }

    /// Structural IR node (the part that is hashed).
    pub fn to_ir(&self) -> IrNode {
        let dependencies = self.dependencies.clone();
        match &self.behavior {
            NodeBehavior::Compute { .. } => IrNode::Compute { dependencies },
            NodeBehavior::Effect { .. } => IrNode::Effect { dependencies },
            NodeBehavior::Router { routes, .. } => IrNode::Router {
                dependencies,
                routes: routes.clone(),
            },
            NodeBehavior::HumanApproval { .. } => IrNode::HumanApproval { dependencies },
            NodeBehavior::Map { .. } => IrNode::Map { dependencies },
            NodeBehavior::Reduce { map_node_id, .. } => IrNode::Reduce {
                dependencies,
                map_node_id: map_node_id.clone(),
            },
            NodeBehavior::Subworkflow {
                workflow_id,
                input_signature,
                ..
            } => IrNode::Subworkflow {
                dependencies,
                sub_workflow_id: workflow_id.clone(),
                input_fn: input_signature.clone(),
            },
            NodeBehavior::Timer { delay_seconds } => IrNode::Timer {
                dependencies,
                delay_seconds: *delay_seconds,
            },
        }
    }

    /// Check a produced value against this node's output contract.
    pub fn validate(&self, output: &Value) -> Result<(), ContractViolation> {
        self.contract.validate(&self.id, output)
    }

    /// Run the single-value handler of a compute, effect, router, or reduce node.
    ///
    /// Every other kind is resolved by the coordinator (or, for MAP, by the
    /// two-phase protocol) and yields [`DispatchError::HandledByCoordinator`].
    pub async fn invoke(&self, ctx: ExecutionContext) -> Result<Value, DispatchError> {
        let result = match &self.behavior {
            NodeBehavior::Compute { handler } | NodeBehavior::Router { handler, .. } => {
                handler(&ctx)
            }
            NodeBehavior::Effect { handler } | NodeBehavior::Reduce { handler, .. } => {
                handler(ctx).await
            }
            _ => return Err(self.handled_by_coordinator()),
        };
        result.map_err(|source| self.handler_error(source))
    }

    /// Phase 1 of a map: produce the item list.
    pub fn items(&self, ctx: &ExecutionContext) -> Result<Vec<Value>, DispatchError> {
        match &self.behavior {
            NodeBehavior::Map { items, .. } => items(ctx).map_err(|source| self.handler_error(source)),
            _ => Err(self.protocol_mismatch("item list requested from a non-MAP node")),
        }
    }

    /// Phase 2 of a map: run the per-item handler.
    pub async fn invoke_item(
        &self,
        ctx: ExecutionContext,
        item: Value,
        index: usize,
    ) -> Result<Value, DispatchError> {
        match &self.behavior {
            NodeBehavior::Map { handler, .. } => handler(ctx, item, index)
                .await
                .map_err(|source| self.handler_error(source)),
            _ => Err(self.protocol_mismatch("map sub-task for a non-MAP node")),
        }
    }

    /// Coordinator phase of a subworkflow: `{"subWorkflowId", "childInput"}`.
    pub fn subworkflow_request(&self, ctx: &ExecutionContext) -> Result<Value, DispatchError> {
        match &self.behavior {
            NodeBehavior::Subworkflow {
                workflow_id, input, ..
            } => {
                let child_input = input(ctx).map_err(|source| self.handler_error(source))?;
                Ok(serde_json::json!({
                    "subWorkflowId": workflow_id,
                    "childInput": child_input,
                }))
            }
            _ => Err(self.protocol_mismatch("subworkflow request from a non-SUBWORKFLOW node")),
        }
    }

    fn handled_by_coordinator(&self) -> DispatchError {
        DispatchError::HandledByCoordinator {
            node_id: self.id.clone(),
            kind: self.kind(),
        }
    }

    fn handler_error(&self, source: HandlerError) -> DispatchError {
        DispatchError::Handler {
            node_id: self.id.clone(),
            source,
        }
    }

    fn protocol_mismatch(&self, detail: &str) -> DispatchError {
        DispatchError::ProtocolMismatch {
            node_id: self.id.clone(),
            detail: detail.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// BuiltWorkflow
// ---------------------------------------------------------------------------

/// An immutable, hash-addressed workflow ready to be registered.
///
/// Cloning is cheap: the IR and the handler table are shared.
#[derive(Clone)]
pub struct BuiltWorkflow {
    workflow_id: String,
    version_hash: String,
    ir_json: String,
    ir: Arc<WorkflowIr>,
    handlers: Arc<IndexMap<String, NodeDefinition>>,
}

impl BuiltWorkflow {
    pub(crate) fn new(
        workflow_id: String,
        version_hash: String,
        ir_json: String,
        ir: WorkflowIr,
        handlers: IndexMap<String, NodeDefinition>,
    ) -> Self {
        Self {
            workflow_id,
            version_hash,
            ir_json,
            ir: Arc::new(ir),
            handlers: Arc::new(handlers),
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// `"sha256:<hex>"` of [`BuiltWorkflow::ir_json`].
    pub fn version_hash(&self) -> &str {
        &self.version_hash
    }

    /// Canonical IR document, exactly as hashed.
    pub fn ir_json(&self) -> &str {
        &self.ir_json
    }

    pub fn ir(&self) -> &WorkflowIr {
        &self.ir
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeDefinition> {
        self.handlers.get(node_id)
    }

    /// Node definitions in declaration order.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeDefinition> {
        self.handlers.values()
    }

    /// Declared dependencies of `node` paired with their kinds.
    pub fn dependency_kinds(&self, node: &NodeDefinition) -> Vec<(String, NodeKind)> {
        node.dependencies
            .iter()
            .filter_map(|dep| self.ir.kind(dep).map(|kind| (dep.clone(), kind)))
            .collect()
    }
}

impl fmt::Debug for BuiltWorkflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuiltWorkflow")
            .field("workflow_id", &self.workflow_id)
            .field("version_hash", &self.version_hash)
            .field("nodes", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
