//! Per-execution run context visible to condition expressions.
//!
//! The expression context has the shape:
//!
//! ```json
//! {
//!   "execution": { "id": "...", "workflow": "nightly-import" },
//!   "input": { ... },
//!   "tasks": { "fetch": <output>, ... }
//! }
//! ```

use serde_json::{Map, Value, json};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct RunContext {
    execution_id: Uuid,
    workflow_name: String,
    input: Value,
    tasks: Map<String, Value>,
}

impl RunContext {
    pub fn new(execution_id: Uuid, workflow_name: impl Into<String>, input: Value) -> Self {
        Self {
            execution_id,
            workflow_name: workflow_name.into(),
            input,
            tasks: Map::new(),
        }
    }

    /// Record the output of an expressed task under `tasks.<name>`.
    pub fn record_output(&mut self, task_name: &str, output: Value) {
        self.tasks.insert(task_name.to_string(), output);
    }

    pub fn output(&self, task_name: &str) -> Option<&Value> {
        self.tasks.get(task_name)
    }

    pub fn input(&self) -> &Value {
        &self.input
    }

    /// Build the JSON object conditions are evaluated against.
    pub fn to_expression_context(&self) -> Value {
        json!({
            "execution": {
                "id": self.execution_id.to_string(),
                "workflow": self.workflow_name,
            },
            "input": self.input,
            "tasks": self.tasks,
        })
    }
}
