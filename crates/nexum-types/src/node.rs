//! Node kinds and router routes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The kind of a workflow node.
///
/// The set is closed: the coordinator and the worker both interpret each kind
/// with a fixed protocol, so new kinds cannot be added at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeKind {
    /// Pure, deterministic step. Not retried.
    Compute,
    /// Side-effecting step, retried with idempotent redelivery.
    Effect,
    /// Selects one of several named branches.
    Router,
    /// Pauses until a human approves or rejects.
    HumanApproval,
    /// Fans out over a dynamically produced item list.
    Map,
    /// Aggregates all per-item results of the preceding map.
    Reduce,
    /// Launches and awaits another workflow.
    Subworkflow,
    /// Waits for a duration before proceeding.
    Timer,
}

impl NodeKind {
    /// All kinds, in declaration order.
    pub const ALL: [NodeKind; 8] = [
        NodeKind::Compute,
        NodeKind::Effect,
        NodeKind::Router,
        NodeKind::HumanApproval,
        NodeKind::Map,
        NodeKind::Reduce,
        NodeKind::Subworkflow,
        NodeKind::Timer,
    ];

    /// Wire spelling of the kind (e.g. `"HUMAN_APPROVAL"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Compute => "COMPUTE",
            NodeKind::Effect => "EFFECT",
            NodeKind::Router => "ROUTER",
            NodeKind::HumanApproval => "HUMAN_APPROVAL",
            NodeKind::Map => "MAP",
            NodeKind::Reduce => "REDUCE",
            NodeKind::Subworkflow => "SUBWORKFLOW",
            NodeKind::Timer => "TIMER",
        }
    }

    /// Whether the coordinator, not a worker, produces this node's result.
    pub fn is_coordinator_resolved(&self) -> bool {
        matches!(
            self,
            NodeKind::HumanApproval | NodeKind::Timer | NodeKind::Subworkflow
        )
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NodeKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("invalid node kind: '{s}'"))
    }
}

/// One branch of a router node.
///
/// Routes are advisory to the client: the coordinator enforces that only the
/// chosen target runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Human-readable condition, e.g. `"score > 0.8"`.
    pub condition: String,
    /// Node ID executed when this route is taken.
    pub target: String,
}

impl Route {
    pub fn new(condition: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            condition: condition.into(),
            target: target.into(),
        }
    }
}
