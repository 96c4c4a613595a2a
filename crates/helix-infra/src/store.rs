//! In-memory execution record store.
//!
//! `DashMap`-backed, last write wins by record ID. Suitable for a single
//! process; nothing survives a restart.

use std::sync::Arc;

use dashmap::DashMap;
use helix_core::repository::ExecutionRecordStore;
use helix_types::error::RepositoryError;
use helix_types::execution::{TaskRun, WorkflowExecution};
use uuid::Uuid;

/// Thread-safe store shared by concurrently running executions.
///
/// Cloning is cheap and clones share the same maps.
#[derive(Debug, Clone, Default)]
pub struct InMemoryExecutionStore {
    executions: Arc<DashMap<Uuid, WorkflowExecution>>,
    task_runs: Arc<DashMap<Uuid, TaskRun>>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_execution(&self, id: Uuid) -> Option<WorkflowExecution> {
        self.executions.get(&id).map(|e| e.value().clone())
    }

    pub fn get_task_run(&self, id: Uuid) -> Option<TaskRun> {
        self.task_runs.get(&id).map(|r| r.value().clone())
    }

    /// All runs of one execution, ordered by task then attempt.
    pub fn runs_for_execution(&self, execution_id: Uuid) -> Vec<TaskRun> {
        let mut runs: Vec<TaskRun> = self
            .task_runs
            .iter()
            .filter(|r| r.execution_id == execution_id)
            .map(|r| r.value().clone())
            .collect();
        runs.sort_by_key(|r| (r.task_id, r.attempt));
        runs
    }

    /// All runs of one task within an execution, in attempt order.
    pub fn runs_for_task(&self, execution_id: Uuid, task_id: Uuid) -> Vec<TaskRun> {
        let mut runs: Vec<TaskRun> = self
            .task_runs
            .iter()
            .filter(|r| r.execution_id == execution_id && r.task_id == task_id)
            .map(|r| r.value().clone())
            .collect();
        runs.sort_by_key(|r| r.attempt);
        runs
    }

    pub fn execution_count(&self) -> usize {
        self.executions.len()
    }

    pub fn task_run_count(&self) -> usize {
        self.task_runs.len()
    }
}

impl ExecutionRecordStore for InMemoryExecutionStore {
    async fn save_workflow_execution(
        &self,
        execution: &WorkflowExecution,
    ) -> Result<(), RepositoryError> {
        // Task runs are stored on their own; keep the row lean.
        let mut row = execution.clone();
        row.task_runs.clear();
        self.executions.insert(execution.id, row);
        Ok(())
    }

    async fn save_task_run(&self, run: &TaskRun) -> Result<(), RepositoryError> {
        self.task_runs.insert(run.id, run.clone());
        Ok(())
    }
}
