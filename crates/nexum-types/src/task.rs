//! Tasks handed to workers by the coordinator.
//!
//! A task is one claimed node execution. Its `input_json` decodes to
//! [`TaskInput`]: the workflow's original input plus the outputs of the
//! node's completed dependencies (a MAP dependency contributes its full
//! result collection).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `node_type` reported by the coordinator for per-item map sub-tasks.
pub const MAP_SUBTASK_NODE_TYPE: &str = "MAP_SUBTASK";

/// A claimed task, decoded from a non-empty poll response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAssignment {
    pub task_id: String,
    pub execution_id: String,
    /// Node the task belongs to. For map sub-tasks this is the parent MAP node.
    pub node_id: String,
    pub input_json: String,
    pub idempotency_key: String,
    /// Coordinator-side node type (`"MAP"`, `"MAP_SUBTASK"`, `"EFFECT"`, ...).
    pub node_type: String,
    pub is_map_subtask: bool,
    pub map_item_json: String,
    pub map_index: u32,
    pub map_total: u32,
}

impl TaskAssignment {
    /// Whether this task is phase 2 of a map (one item).
    pub fn is_map_subtask(&self) -> bool {
        self.is_map_subtask || self.node_type == MAP_SUBTASK_NODE_TYPE
    }

    /// Decode `input_json`. An empty payload decodes to a null input with no deps.
    pub fn decode_input(&self) -> Result<TaskInput, serde_json::Error> {
        if self.input_json.trim().is_empty() {
            return Ok(TaskInput::default());
        }
        serde_json::from_str(&self.input_json)
    }

    /// Decode the single map item carried by a map sub-task.
    pub fn decode_map_item(&self) -> Result<Value, serde_json::Error> {
        if self.map_item_json.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&self.map_item_json)
    }
}

/// Decoded task input: `{ "input": ..., "deps": { "<node>": <output> } }`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskInput {
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub deps: HashMap<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task(input_json: &str) -> TaskAssignment {
        TaskAssignment {
            task_id: "task-1".to_string(),
            execution_id: "exec-1".to_string(),
            node_id: "b".to_string(),
            input_json: input_json.to_string(),
            idempotency_key: "exec-1:b:sha256:00".to_string(),
            node_type: "COMPUTE".to_string(),
            is_map_subtask: false,
            map_item_json: String::new(),
            map_index: 0,
            map_total: 0,
        }
    }

    #[test]
    fn test_decode_input_with_deps() {
        let t = task(r#"{"input":{"query":"rust"},"deps":{"a":{"x":1}}}"#);
        let input = t.decode_input().unwrap();
        assert_eq!(input.input, json!({"query": "rust"}));
        assert_eq!(input.deps["a"], json!({"x": 1}));
    }

    #[test]
    fn test_decode_empty_input() {
        let input = task("").decode_input().unwrap();
        assert_eq!(input.input, Value::Null);
        assert!(input.deps.is_empty());

        let input = task("{}").decode_input().unwrap();
        assert_eq!(input, TaskInput::default());
    }

    #[test]
    fn test_decode_malformed_input_errors() {
        assert!(task("{not json").decode_input().is_err());
    }

    #[test]
    fn test_map_subtask_detection() {
        let mut t = task("");
        assert!(!t.is_map_subtask());
        t.node_type = MAP_SUBTASK_NODE_TYPE.to_string();
        assert!(t.is_map_subtask());

        let mut t = task("");
        t.is_map_subtask = true;
        t.map_item_json = r#"{"url":"https://example.com"}"#.to_string();
        assert!(t.is_map_subtask());
        assert_eq!(
            t.decode_map_item().unwrap(),
            json!({"url": "https://example.com"})
        );
    }
}
