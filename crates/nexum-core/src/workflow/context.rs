//! Read-only view handed to node handlers.
//!
//! An [`ExecutionContext`] exposes the workflow input and the outputs of the
//! node's completed dependencies. Lookups are checked against the node's
//! declared dependency list so a handler cannot silently read a node it does
//! not depend on.

use std::collections::HashMap;

use indexmap::IndexMap;
use nexum_types::node::NodeKind;
use nexum_types::task::{TaskAssignment, TaskInput};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

/// Errors raised by context lookups.
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("node '{node_id}' is not a dependency of '{requested_by}'")]
    NotADependency {
        node_id: String,
        requested_by: String,
    },

    #[error("dependency '{0}' has not completed")]
    NotCompleted(String),

    #[error("'{0}' is not a MAP node or not completed")]
    NotAMapNode(String),

    #[error("failed to decode {what}: {source}")]
    Decode {
        what: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Task metadata visible to handlers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskMeta {
    pub execution_id: String,
    pub node_id: String,
    pub task_id: String,
    pub idempotency_key: String,
    /// `(index, total)` when this is a map sub-task.
    pub map_position: Option<(u32, u32)>,
}

impl From<&TaskAssignment> for TaskMeta {
    fn from(task: &TaskAssignment) -> Self {
        Self {
            execution_id: task.execution_id.clone(),
            node_id: task.node_id.clone(),
            task_id: task.task_id.clone(),
            idempotency_key: task.idempotency_key.clone(),
            map_position: task
                .is_map_subtask()
                .then_some((task.map_index, task.map_total)),
        }
    }
}

/// The workflow input plus completed dependency outputs for one task.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    input: Value,
    outputs: HashMap<String, Value>,
    /// Declared dependencies and their kinds, in declaration order.
    dependencies: IndexMap<String, NodeKind>,
    meta: TaskMeta,
}

impl ExecutionContext {
    /// Context with the given workflow input and no dependencies.
    pub fn new(input: Value) -> Self {
        Self {
            input,
            ..Self::default()
        }
    }

    /// Build the context for a claimed task from its decoded input.
    ///
    /// `dependencies` pairs each declared dependency id with its node kind.
    pub fn from_task(
        task: &TaskAssignment,
        input: TaskInput,
        dependencies: impl IntoIterator<Item = (String, NodeKind)>,
    ) -> Self {
        Self {
            input: input.input,
            outputs: input.deps,
            dependencies: dependencies.into_iter().collect(),
            meta: TaskMeta::from(task),
        }
    }

    /// Declare a dependency, optionally with its completed output.
    pub fn with_dependency(
        mut self,
        node_id: impl Into<String>,
        kind: NodeKind,
        output: Option<Value>,
    ) -> Self {
        let node_id = node_id.into();
        if let Some(output) = output {
            self.outputs.insert(node_id.clone(), output);
        }
        self.dependencies.insert(node_id, kind);
        self
    }

    pub fn with_meta(mut self, meta: TaskMeta) -> Self {
        self.meta = meta;
        self
    }

    /// The workflow's original input.
    pub fn input(&self) -> &Value {
        &self.input
    }

    /// Decode the workflow input as `T`.
    pub fn input_as<T: DeserializeOwned>(&self) -> Result<T, ContextError> {
        T::deserialize(&self.input).map_err(|source| ContextError::Decode {
            what: "workflow input".to_string(),
            source,
        })
    }

    /// Output of a completed dependency.
    pub fn get(&self, node_id: &str) -> Result<&Value, ContextError> {
        if !self.dependencies.contains_key(node_id) {
            return Err(ContextError::NotADependency {
                node_id: node_id.to_string(),
                requested_by: self.meta.node_id.clone(),
            });
        }
        self.outputs
            .get(node_id)
            .ok_or_else(|| ContextError::NotCompleted(node_id.to_string()))
    }

    /// Output of a completed dependency, decoded as `T`.
    pub fn get_as<T: DeserializeOwned>(&self, node_id: &str) -> Result<T, ContextError> {
        let value = self.get(node_id)?;
        T::deserialize(value).map_err(|source| ContextError::Decode {
            what: format!("output of '{node_id}'"),
            source,
        })
    }

    /// All per-item results of a MAP dependency, ordered by item index.
    pub fn get_map_results(&self, map_node_id: &str) -> Result<&[Value], ContextError> {
        match self.dependencies.get(map_node_id) {
            None => {
                return Err(ContextError::NotADependency {
                    node_id: map_node_id.to_string(),
                    requested_by: self.meta.node_id.clone(),
                });
            }
            Some(NodeKind::Map) => {}
            Some(_) => return Err(ContextError::NotAMapNode(map_node_id.to_string())),
        }
        match self.outputs.get(map_node_id) {
            Some(Value::Array(results)) => Ok(results),
            _ => Err(ContextError::NotCompleted(map_node_id.to_string())),
        }
    }

    /// Declared dependency ids, in declaration order.
    pub fn dependencies(&self) -> impl Iterator<Item = &str> {
        self.dependencies.keys().map(String::as_str)
    }

    pub fn execution_id(&self) -> &str {
        &self.meta.execution_id
    }

    pub fn node_id(&self) -> &str {
        &self.meta.node_id
    }

    pub fn task_id(&self) -> &str {
        &self.meta.task_id
    }

    /// Key identifying this node execution across redeliveries. Effect
    /// handlers pass it to external systems to deduplicate side effects.
    pub fn idempotency_key(&self) -> &str {
        &self.meta.idempotency_key
    }

    /// `(index, total)` when running a map sub-task.
    pub fn map_position(&self) -> Option<(u32, u32)> {
        self.meta.map_position
    }
}
