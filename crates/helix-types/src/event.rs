//! Domain events emitted by the workflow engine.
//!
//! `DomainEvent` is the closed set of lifecycle events. Each one is wrapped
//! in an `EventEnvelope` before it reaches a publisher. All types are
//! Clone + Send + Sync for use with tokio broadcast channels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::execution::{ExecutionStatus, ExpressionStatus};

/// Lifecycle events for workflow executions and task runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    /// A workflow execution changed status.
    WorkflowExecutionTransitioned {
        execution_id: Uuid,
        workflow_id: Uuid,
        tenant_id: Uuid,
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    /// A task run changed status.
    ///
    /// `to: dysregulated` with `retry_scheduled` marks a failed attempt that
    /// will be retried, not a failed task.
    TaskRunTransitioned {
        execution_id: Uuid,
        task_id: Uuid,
        run_id: Uuid,
        from: ExpressionStatus,
        to: ExpressionStatus,
        attempt: u32,
        #[serde(default)]
        retry_scheduled: bool,
    },

    /// A retryable failure was observed and another attempt will follow.
    TaskRetryScheduled {
        execution_id: Uuid,
        task_id: Uuid,
        failed_attempt: u32,
        next_attempt: u32,
        delay_ms: u64,
        error: String,
    },

    /// Every task of a stage reached a terminal status (or the stage was aborted).
    StageCompleted {
        execution_id: Uuid,
        stage_id: Uuid,
        stage_name: String,
        faulted: bool,
        terminated: bool,
    },

    /// Preflight validation rejected the definition.
    ValidationFailed {
        execution_id: Uuid,
        workflow_id: Uuid,
        messages: Vec<String>,
    },
}

impl DomainEvent {
    /// Stable event kind identifier (the serde tag).
    pub fn kind(&self) -> &'static str {
        match self {
            DomainEvent::WorkflowExecutionTransitioned { .. } => "workflow_execution_transitioned",
            DomainEvent::TaskRunTransitioned { .. } => "task_run_transitioned",
            DomainEvent::TaskRetryScheduled { .. } => "task_retry_scheduled",
            DomainEvent::StageCompleted { .. } => "stage_completed",
            DomainEvent::ValidationFailed { .. } => "validation_failed",
        }
    }

    /// Execution the event belongs to.
    pub fn execution_id(&self) -> Uuid {
        match self {
            DomainEvent::WorkflowExecutionTransitioned { execution_id, .. }
            | DomainEvent::TaskRunTransitioned { execution_id, .. }
            | DomainEvent::TaskRetryScheduled { execution_id, .. }
            | DomainEvent::StageCompleted { execution_id, .. }
            | DomainEvent::ValidationFailed { execution_id, .. } => *execution_id,
        }
    }
}

/// Envelope carried to event publishers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: Uuid,
    pub occurred_on: DateTime<Utc>,
    pub kind: String,
    pub payload: DomainEvent,
}

impl EventEnvelope {
    pub fn new(payload: DomainEvent) -> Self {
        Self {
            id: Uuid::now_v7(),
            occurred_on: Utc::now(),
            kind: payload.kind().to_string(),
            payload,
        }
    }
}
