//! Execution record types.
//!
//! `WorkflowExecution` is the aggregate for one run of a workflow definition;
//! `TaskRun` is one attempt of one task instance inside it. Both carry a
//! status whose legal edges are encoded by `can_transition_to`, so callers
//! can reject regressions before persisting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::TransitionError;
use crate::workflow::WorkflowDefinition;

// ---------------------------------------------------------------------------
// Execution Status
// ---------------------------------------------------------------------------

/// Lifecycle of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Idle,
    Running,
    Completed,
    Skipped,
    Faulted,
    Terminated,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed
                | ExecutionStatus::Skipped
                | ExecutionStatus::Faulted
                | ExecutionStatus::Terminated
        )
    }

    /// Whether `self -> next` is a legal edge.
    ///
    /// `Idle` may go to `Running` or directly to `Skipped`, `Faulted`,
    /// `Terminated` (gating, failed validation, cancellation before start).
    /// `Running` may end in any terminal state except `Skipped`.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Idle, Running)
                | (Idle, Skipped)
                | (Idle, Faulted)
                | (Idle, Terminated)
                | (Running, Completed)
                | (Running, Faulted)
                | (Running, Terminated)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Idle => "idle",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Skipped => "skipped",
            ExecutionStatus::Faulted => "faulted",
            ExecutionStatus::Terminated => "terminated",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Expression Status
// ---------------------------------------------------------------------------

/// Lifecycle of a single task run (one attempt).
///
/// A failed attempt that will be retried also ends `Dysregulated`, with
/// [`TaskRun::retry_scheduled`] set. The status of a task is therefore read
/// from its latest run only: earlier runs with `retry_scheduled` are
/// superseded attempts, not task failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpressionStatus {
    /// Created, not yet started.
    Quiescent,
    /// Executor invoked, awaiting outcome.
    Expressing,
    /// Finished successfully.
    Expressed,
    /// Bypassed by a condition gate.
    Skipped,
    /// Failed.
    Dysregulated,
    /// Cancelled.
    Terminated,
}

impl ExpressionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            ExpressionStatus::Quiescent | ExpressionStatus::Expressing
        )
    }

    pub fn can_transition_to(&self, next: ExpressionStatus) -> bool {
        use ExpressionStatus::*;
        matches!(
            (self, next),
            (Quiescent, Expressing)
                | (Quiescent, Skipped)
                | (Quiescent, Dysregulated)
                | (Quiescent, Terminated)
                | (Expressing, Expressed)
                | (Expressing, Dysregulated)
                | (Expressing, Terminated)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExpressionStatus::Quiescent => "quiescent",
            ExpressionStatus::Expressing => "expressing",
            ExpressionStatus::Expressed => "expressed",
            ExpressionStatus::Skipped => "skipped",
            ExpressionStatus::Dysregulated => "dysregulated",
            ExpressionStatus::Terminated => "terminated",
        }
    }
}

impl std::fmt::Display for ExpressionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Workflow Execution
// ---------------------------------------------------------------------------

/// One execution of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    /// UUIDv7 execution ID.
    pub id: Uuid,
    pub workflow_id: Uuid,
    /// Denormalized for display.
    pub workflow_name: String,
    pub workflow_version: String,
    pub tenant_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    pub status: ExecutionStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Task runs in creation order.
    #[serde(default)]
    pub task_runs: Vec<TaskRun>,
    /// Human-readable outcome messages.
    #[serde(default)]
    pub messages: Vec<String>,
    /// Caller-supplied payload, visible to condition expressions as `input`.
    #[serde(default)]
    pub input: Value,
}

impl WorkflowExecution {
    /// Create an `Idle` execution for `definition`.
    pub fn new(id: Uuid, definition: &WorkflowDefinition, user_id: Option<Uuid>, input: Value) -> Self {
        Self {
            id,
            workflow_id: definition.id,
            workflow_name: definition.name.clone(),
            workflow_version: definition.version.clone(),
            tenant_id: definition.tenant_id,
            user_id,
            status: ExecutionStatus::Idle,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            task_runs: Vec::new(),
            messages: Vec::new(),
            input,
        }
    }

    /// Move to `next`, stamping `started_at` / `completed_at`.
    pub fn transition(&mut self, next: ExecutionStatus) -> Result<ExecutionStatus, TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                entity: "execution",
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        let prior = self.status;
        let now = Utc::now();
        if next == ExecutionStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        self.status = next;
        Ok(prior)
    }

    /// Insert or replace a task run by ID, keeping creation order.
    pub fn upsert_task_run(&mut self, run: &TaskRun) {
        match self.task_runs.iter_mut().find(|r| r.id == run.id) {
            Some(existing) => *existing = run.clone(),
            None => self.task_runs.push(run.clone()),
        }
    }

    /// Latest run (highest attempt) for the given task instance.
    pub fn latest_run_for(&self, task_id: Uuid) -> Option<&TaskRun> {
        self.task_runs
            .iter()
            .filter(|r| r.task_id == task_id)
            .max_by_key(|r| r.attempt)
    }
}

// ---------------------------------------------------------------------------
// Task Run
// ---------------------------------------------------------------------------

/// One attempt of one task instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRun {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub tenant_id: Uuid,
    pub stage_id: Uuid,
    pub task_id: Uuid,
    pub task_name: String,
    /// Executor kind, once resolved from the template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// 1-based attempt number.
    pub attempt: u32,
    pub status: ExpressionStatus,
    /// Parameters as supplied to the executor.
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ExpressionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// This attempt failed retryably and another attempt follows.
    #[serde(default)]
    pub retry_scheduled: bool,
}

impl TaskRun {
    /// Create a `Quiescent` run for the given attempt.
    pub fn new(
        execution_id: Uuid,
        tenant_id: Uuid,
        stage_id: Uuid,
        task_id: Uuid,
        task_name: impl Into<String>,
        attempt: u32,
        parameters: Map<String, Value>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            execution_id,
            tenant_id,
            stage_id,
            task_id,
            task_name: task_name.into(),
            kind: None,
            attempt,
            status: ExpressionStatus::Quiescent,
            parameters,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            result: None,
            error: None,
            retry_scheduled: false,
        }
    }

    /// True once this run decides its task's status: terminal and not
    /// superseded by a scheduled retry.
    pub fn is_final(&self) -> bool {
        self.status.is_terminal() && !self.retry_scheduled
    }

    /// A fresh `Quiescent` run for the next attempt of the same task.
    pub fn next_attempt(&self) -> Self {
        let mut next = Self::new(
            self.execution_id,
            self.tenant_id,
            self.stage_id,
            self.task_id,
            self.task_name.clone(),
            self.attempt + 1,
            self.parameters.clone(),
        );
        next.kind = self.kind.clone();
        next
    }

    /// Move to `next`, stamping timestamps and duration.
    pub fn transition(&mut self, next: ExpressionStatus) -> Result<ExpressionStatus, TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                entity: "task run",
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        let prior = self.status;
        let now = Utc::now();
        if next == ExpressionStatus::Expressing {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
            if let Some(started) = self.started_at {
                self.duration_ms = Some((now - started).num_milliseconds().max(0) as u64);
            }
        }
        self.status = next;
        Ok(prior)
    }
}

/// Immutable outcome of one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpressionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempt: u32,
}

impl ExpressionResult {
    pub fn success(output: Value, attempt: u32) -> Self {
        Self {
            success: true,
            output: Some(output),
            error: None,
            attempt,
        }
    }

    pub fn failure(error: impl Into<String>, attempt: u32) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
            attempt,
        }
    }
}

// ---------------------------------------------------------------------------
// Stage Report
// ---------------------------------------------------------------------------

/// Aggregated outcome of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    NotStarted,
    Completed,
    Faulted,
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub stage_id: Uuid,
    pub name: String,
    pub priority: i64,
    pub status: StageStatus,
    pub best_effort: bool,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
