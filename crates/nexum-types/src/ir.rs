//! Canonical intermediate representation (IR) of a workflow's node graph.
//!
//! The IR is the structural description that gets hashed into a workflow's
//! version identifier. It carries node kinds, dependency lists, and the
//! kind-specific fields the coordinator needs to schedule nodes, never
//! handler code. Serialized form:
//!
//! ```json
//! {"nodes":{"a":{"type":"COMPUTE","dependencies":[]},
//!           "r":{"type":"REDUCE","dependencies":["a"],"mapNodeId":"a"}}}
//! ```
//!
//! Nodes are kept in declaration order so the serialized JSON (and therefore
//! the hash) is a pure function of the declared graph.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::node::{NodeKind, Route};

// ---------------------------------------------------------------------------
// IrNode
// ---------------------------------------------------------------------------

/// A single node in the canonical IR.
///
/// One variant per [`NodeKind`], each carrying only the fields that kind
/// defines. Internally tagged by `type` to match the wire layout; optional
/// fields are omitted rather than serialized as `null`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IrNode {
    Compute {
        dependencies: Vec<String>,
    },
    Effect {
        dependencies: Vec<String>,
    },
    Router {
        dependencies: Vec<String>,
        routes: Vec<Route>,
    },
    HumanApproval {
        dependencies: Vec<String>,
    },
    Map {
        dependencies: Vec<String>,
    },
    Reduce {
        dependencies: Vec<String>,
        #[serde(rename = "mapNodeId")]
        map_node_id: String,
    },
    Subworkflow {
        dependencies: Vec<String>,
        #[serde(rename = "subWorkflowId")]
        sub_workflow_id: String,
        #[serde(rename = "inputFn", default, skip_serializing_if = "Option::is_none")]
        input_fn: Option<String>,
    },
    Timer {
        dependencies: Vec<String>,
        delay_seconds: u64,
    },
}

impl IrNode {
    /// The node's kind tag.
    pub fn kind(&self) -> NodeKind {
        match self {
            IrNode::Compute { .. } => NodeKind::Compute,
            IrNode::Effect { .. } => NodeKind::Effect,
            IrNode::Router { .. } => NodeKind::Router,
            IrNode::HumanApproval { .. } => NodeKind::HumanApproval,
            IrNode::Map { .. } => NodeKind::Map,
            IrNode::Reduce { .. } => NodeKind::Reduce,
            IrNode::Subworkflow { .. } => NodeKind::Subworkflow,
            IrNode::Timer { .. } => NodeKind::Timer,
        }
    }

    /// Declared dependencies, in the order given at declaration.
    pub fn dependencies(&self) -> &[String] {
        match self {
            IrNode::Compute { dependencies }
            | IrNode::Effect { dependencies }
            | IrNode::Router { dependencies, .. }
            | IrNode::HumanApproval { dependencies }
            | IrNode::Map { dependencies }
            | IrNode::Reduce { dependencies, .. }
            | IrNode::Subworkflow { dependencies, .. }
            | IrNode::Timer { dependencies, .. } => dependencies,
        }
    }

    /// Router routes, if this is a router node.
    pub fn routes(&self) -> Option<&[Route]> {
        match self {
            IrNode::Router { routes, .. } => Some(routes),
            _ => None,
        }
    }

    /// Timer delay, if this is a timer node.
    pub fn delay_seconds(&self) -> Option<u64> {
        match self {
            IrNode::Timer { delay_seconds, .. } => Some(*delay_seconds),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowIr
// ---------------------------------------------------------------------------

/// The canonical node map of a workflow, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowIr {
    pub nodes: IndexMap<String, IrNode>,
}

impl WorkflowIr {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse an IR document (as produced by [`WorkflowIr::to_canonical_json`]).
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize to the canonical compact JSON form that is hashed.
    pub fn to_canonical_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn node(&self, node_id: &str) -> Option<&IrNode> {
        self.nodes.get(node_id)
    }

    pub fn kind(&self, node_id: &str) -> Option<NodeKind> {
        self.nodes.get(node_id).map(IrNode::kind)
    }

    pub fn dependencies(&self, node_id: &str) -> Option<&[String]> {
        self.nodes.get(node_id).map(IrNode::dependencies)
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Iterate nodes in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &IrNode)> {
        self.nodes.iter().map(|(id, node)| (id.as_str(), node))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
