//! Output contracts: the declared shape of a node's successful result.
//!
//! A contract is built from a Rust type: its JSON Schema (via `schemars`) is
//! kept for inspection, and a produced value is validated by deserializing it
//! into that type. Contracts are checked locally by the worker before a
//! result is reported; they never affect the wire format or the version hash.

use std::fmt;
use std::sync::Arc;

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

type Validator = dyn Fn(&Value) -> Result<(), String> + Send + Sync;

/// A produced value did not match the node's output contract.
#[derive(Debug, Clone, Error)]
#[error("output of node '{node_id}' violates contract {contract}: {reason}")]
pub struct ContractViolation {
    pub node_id: String,
    pub contract: String,
    pub reason: String,
}

/// Schema and validator for a node's output.
#[derive(Clone)]
pub struct OutputContract {
    name: String,
    schema: Arc<Value>,
    validator: Arc<Validator>,
}

impl OutputContract {
    /// Contract requiring the output to deserialize as `T`.
    pub fn of<T>() -> Self
    where
        T: JsonSchema + DeserializeOwned + 'static,
    {
        let schema = schemars::schema_for!(T).to_value();
        Self {
            name: T::schema_name().into_owned(),
            schema: Arc::new(schema),
            validator: Arc::new(|value: &Value| {
                T::deserialize(value)
                    .map(|_| ())
                    .map_err(|e| e.to_string())
            }),
        }
    }

    /// Contract accepting any JSON value.
    pub fn any() -> Self {
        Self {
            name: "any".to_string(),
            schema: Arc::new(Value::Bool(true)),
            validator: Arc::new(|_| Ok(())),
        }
    }

    /// Name of the contracted type (`"any"` for [`OutputContract::any`]).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// JSON Schema of the contracted type.
    pub fn schema(&self) -> &Value {
        &self.schema
    }

    /// Check `value` against the contract on behalf of `node_id`.
    pub fn validate(&self, node_id: &str, value: &Value) -> Result<(), ContractViolation> {
        (self.validator)(value).map_err(|reason| ContractViolation {
            node_id: node_id.to_string(),
            contract: self.name.clone(),
            reason,
        })
    }
}

impl fmt::Debug for OutputContract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputContract")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Coordinator-shaped outputs
// ---------------------------------------------------------------------------

/// Output of a router node: the route target that was taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RouteDecision {
    pub routed_to: String,
}

impl RouteDecision {
    pub fn to(target: impl Into<String>) -> Self {
        Self {
            routed_to: target.into(),
        }
    }
}

/// Output recorded by the coordinator when a human-approval node is resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ApprovalOutcome {
    pub approved: bool,
    pub approver: String,
    #[serde(default)]
    pub comment: String,
}

/// Output recorded by the coordinator when a timer fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TimerOutcome {
    /// RFC 3339 timestamp at which the timer fired.
    pub waited_until: String,
    pub delay_seconds: u64,
}
