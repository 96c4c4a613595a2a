//! Workflow definition types.
//!
//! A `WorkflowDefinition` is an ordered set of `Stage`s, each holding an
//! ordered set of `TaskInstance`s. Every task instance references a
//! `TaskTemplate` that declares its parameter schema and executor kind.
//! Definitions are read-only to the engine; a new version is a new definition.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// A versioned, tenant-scoped workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// UUIDv7 assigned when the definition is published.
    pub id: Uuid,
    /// Owning tenant. Every nested entity must carry the same tenant.
    pub tenant_id: Uuid,
    /// Human-readable workflow name.
    pub name: String,
    /// Version string (e.g. "1.0.0").
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Optional JEXL gate. When it evaluates to false the whole execution is skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Stages in declaration order. Execution order is by `priority`, then declaration.
    pub stages: Vec<Stage>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl WorkflowDefinition {
    /// Iterate every task instance across all stages, in declaration order.
    pub fn tasks(&self) -> impl Iterator<Item = (&Stage, &TaskInstance)> {
        self.stages
            .iter()
            .flat_map(|stage| stage.tasks.iter().map(move |task| (stage, task)))
    }

    /// Total number of task instances in the definition.
    pub fn task_count(&self) -> usize {
        self.stages.iter().map(|s| s.tasks.len()).sum()
    }
}

/// A group of tasks executed either sequentially or in parallel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub id: Uuid,
    pub name: String,
    /// Lower executes first. Must be non-negative.
    #[serde(default)]
    pub priority: i64,
    /// Launch every task of the stage concurrently.
    #[serde(default)]
    pub run_in_parallel: bool,
    /// Record a fault in this stage but keep executing later stages.
    #[serde(default)]
    pub best_effort: bool,
    pub tasks: Vec<TaskInstance>,
}

// ---------------------------------------------------------------------------
// Task Template
// ---------------------------------------------------------------------------

/// Schema and executor kind for task instances created from it.
///
/// Templates are used for validation and executor resolution only; they are
/// never executed directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskTemplate {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    /// Executor kind identifier looked up in the executor registry.
    pub kind: String,
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
}

impl TaskTemplate {
    /// Find the declared parameter with the given name.
    pub fn parameter(&self, name: &str) -> Option<&ParameterSpec> {
        self.parameters.iter().find(|p| p.name == name)
    }
}

/// One declared parameter of a task template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParameterType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// JSON type a parameter value must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterType {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
    Any,
}

impl ParameterType {
    /// Whether `value` is compatible with this type.
    ///
    /// `Integer` accepts only JSON numbers without a fractional part;
    /// `Number` accepts any JSON number.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            ParameterType::String => value.is_string(),
            ParameterType::Integer => value.is_i64() || value.is_u64(),
            ParameterType::Number => value.is_number(),
            ParameterType::Boolean => value.is_boolean(),
            ParameterType::Object => value.is_object(),
            ParameterType::Array => value.is_array(),
            ParameterType::Any => true,
        }
    }
}

impl std::fmt::Display for ParameterType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ParameterType::String => "string",
            ParameterType::Integer => "integer",
            ParameterType::Number => "number",
            ParameterType::Boolean => "boolean",
            ParameterType::Object => "object",
            ParameterType::Array => "array",
            ParameterType::Any => "any",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Task Instance
// ---------------------------------------------------------------------------

/// A concrete, parameterized unit of work derived from a template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInstance {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub template_id: Uuid,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub configuration: TaskConfiguration,
    /// Tasks that must finish before this one (declared ordering dependency).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<Uuid>,
    /// Optional JEXL gate. When it evaluates to false the task is skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Retry override. Falls back to the engine default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Per-attempt timeout. Falls back to the engine default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// Per-task configuration record handed to the executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskConfiguration {
    /// Executor-specific operation name.
    #[serde(default)]
    pub operation: String,
    #[serde(default)]
    pub mode: TaskMode,
    #[serde(default)]
    pub run_in_parallel: bool,
    #[serde(default)]
    pub priority: i64,
}

impl Default for TaskConfiguration {
    fn default() -> Self {
        Self {
            operation: String::new(),
            mode: TaskMode::Execute,
            run_in_parallel: false,
            priority: 0,
        }
    }
}

/// How a task is expressed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskMode {
    /// Invoke the executor.
    #[default]
    Execute,
    /// Validate and record success without invoking the executor.
    DryRun,
}

// ---------------------------------------------------------------------------
// Retry Policy
// ---------------------------------------------------------------------------

/// Retry policy for a task.
///
/// `backoff_coefficient` is the jitter coefficient: a retry delay is drawn
/// from `[base, base * (1 + backoff_coefficient)]` where
/// `base = initial_delay_ms * 2^attempt`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first (default 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_backoff_coefficient")]
    pub backoff_coefficient: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_backoff_coefficient() -> f64 {
    0.2
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            backoff_coefficient: default_backoff_coefficient(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay_ms: 0,
            backoff_coefficient: 0.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Workflow Bundle
// ---------------------------------------------------------------------------

/// A definition together with the templates its tasks reference.
///
/// This is the unit the authoring side hands to the engine and the shape of
/// workflow files on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowBundle {
    pub definition: WorkflowDefinition,
    #[serde(default)]
    pub templates: Vec<TaskTemplate>,
}

impl WorkflowBundle {
    /// Index templates by ID.
    pub fn template_catalog(&self) -> HashMap<Uuid, TaskTemplate> {
        self.templates
            .iter()
            .map(|t| (t.id, t.clone()))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
