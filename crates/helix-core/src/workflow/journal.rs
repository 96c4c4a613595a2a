//! Run journal: best-effort persistence and publication for one execution.
//!
//! Wraps the record store and event publisher. Every lifecycle transition is
//! persisted and then published; a collaborator failure is logged and kept
//! as a [`CollaboratorWarning`] but never rolls back the state machine.

use std::sync::Arc;

use helix_types::event::{DomainEvent, EventEnvelope};
use helix_types::execution::{ExecutionStatus, ExpressionStatus, TaskRun, WorkflowExecution};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::event::EventPublisher;
use crate::repository::ExecutionRecordStore;

/// A store or publisher call that failed during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollaboratorWarning {
    /// The collaborator call, e.g. `save_task_run` or `publish:stage_completed`.
    pub operation: String,
    /// Execution, task run or event the call was about.
    pub entity_id: Uuid,
    pub message: String,
}

pub struct RunJournal<S: ExecutionRecordStore, P: EventPublisher> {
    store: Arc<S>,
    publisher: Arc<P>,
    warnings: Mutex<Vec<CollaboratorWarning>>,
}

impl<S: ExecutionRecordStore, P: EventPublisher> RunJournal<S, P> {
    pub fn new(store: Arc<S>, publisher: Arc<P>) -> Self {
        Self {
            store,
            publisher,
            warnings: Mutex::new(Vec::new()),
        }
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    pub async fn save_execution(&self, execution: &WorkflowExecution) {
        if let Err(e) = self.store.save_workflow_execution(execution).await {
            self.warn("save_workflow_execution", execution.id, e.to_string())
                .await;
        }
    }

    pub async fn save_task_run(&self, run: &TaskRun) {
        if let Err(e) = self.store.save_task_run(run).await {
            self.warn("save_task_run", run.id, e.to_string()).await;
        }
    }

    // -----------------------------------------------------------------------
    // Publication
    // -----------------------------------------------------------------------

    pub async fn publish(&self, event: DomainEvent) {
        let envelope = EventEnvelope::new(event);
        let operation = format!("publish:{}", envelope.kind);
        let envelope_id = envelope.id;
        if let Err(e) = self.publisher.publish(envelope).await {
            self.warn(&operation, envelope_id, e.to_string()).await;
        }
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// Persist the execution and publish `WorkflowExecutionTransitioned`.
    pub async fn execution_transitioned(
        &self,
        execution: &WorkflowExecution,
        from: ExecutionStatus,
    ) {
        tracing::debug!(
            execution_id = %execution.id,
            from = %from,
            to = %execution.status,
            "execution transitioned"
        );
        self.save_execution(execution).await;
        self.publish(DomainEvent::WorkflowExecutionTransitioned {
            execution_id: execution.id,
            workflow_id: execution.workflow_id,
            tenant_id: execution.tenant_id,
            from,
            to: execution.status,
        })
        .await;
    }

    /// Persist the run and publish `TaskRunTransitioned`.
    pub async fn task_run_transitioned(&self, run: &TaskRun, from: ExpressionStatus) {
        tracing::debug!(
            execution_id = %run.execution_id,
            task_id = %run.task_id,
            run_id = %run.id,
            attempt = run.attempt,
            from = %from,
            to = %run.status,
            retry_scheduled = run.retry_scheduled,
            "task run transitioned"
        );
        self.save_task_run(run).await;
        self.publish(DomainEvent::TaskRunTransitioned {
            execution_id: run.execution_id,
            task_id: run.task_id,
            run_id: run.id,
            from,
            to: run.status,
            attempt: run.attempt,
            retry_scheduled: run.retry_scheduled,
        })
        .await;
    }

    // -----------------------------------------------------------------------
    // Warnings
    // -----------------------------------------------------------------------

    async fn warn(&self, operation: &str, entity_id: Uuid, message: String) {
        tracing::warn!(
            operation,
            entity_id = %entity_id,
            error = message.as_str(),
            "collaborator call failed"
        );
        self.warnings.lock().await.push(CollaboratorWarning {
            operation: operation.to_string(),
            entity_id,
            message,
        });
    }

    /// Warnings recorded so far.
    pub async fn warnings(&self) -> Vec<CollaboratorWarning> {
        self.warnings.lock().await.clone()
    }
}
