//! Execution record store trait definition.
//!
//! Persists workflow executions and task runs as the engine moves them
//! through their lifecycles. Durability and distribution belong to the
//! implementation; the engine only writes.

use helix_types::error::RepositoryError;
use helix_types::execution::{TaskRun, WorkflowExecution};

/// Store for execution records.
///
/// Both writes are upserts keyed by record ID and must be idempotent:
/// writing an identical record twice leaves no observable difference.
/// Implementations are shared across concurrently running executions and
/// must tolerate concurrent writes.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait ExecutionRecordStore: Send + Sync {
    /// Insert or replace a workflow execution by ID.
    fn save_workflow_execution(
        &self,
        execution: &WorkflowExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Insert or replace a task run by ID.
    fn save_task_run(
        &self,
        run: &TaskRun,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}
