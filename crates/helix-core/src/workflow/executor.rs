//! Task executor trait.
//!
//! An executor performs the actual work of one task kind. The engine hands
//! it a `TaskInvocation` and a cancellation token and classifies the result:
//! success, a retryable failure, a fatal failure, or cooperative cancellation.

use helix_types::workflow::TaskMode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Everything an executor receives for one attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInvocation {
    pub execution_id: Uuid,
    pub task_id: Uuid,
    pub run_id: Uuid,
    pub task_name: String,
    pub kind: String,
    pub operation: String,
    pub mode: TaskMode,
    /// 1-based attempt number.
    pub attempt: u32,
    pub parameters: Map<String, Value>,
    pub run_in_parallel: bool,
    pub priority: i64,
    /// Read-only run context (`input`, `tasks.<name>` outputs).
    pub context: Value,
}

/// Failure reported by an executor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutorFailure {
    /// Transient failure; the engine may retry per the task's policy.
    #[error("retryable failure: {0}")]
    Retryable(String),

    /// Permanent failure; the task is not retried.
    #[error("fatal failure: {0}")]
    Fatal(String),

    /// The executor observed cancellation and stopped.
    #[error("cancelled")]
    Cancelled,
}

impl ExecutorFailure {
    pub fn retryable(message: impl Into<String>) -> Self {
        ExecutorFailure::Retryable(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        ExecutorFailure::Fatal(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ExecutorFailure::Retryable(_))
    }
}

/// Implementation of one task kind.
///
/// Uses RPITIT (return-position `impl Trait` in traits) for async methods.
/// For runtime selection by kind, wrap implementations in
/// [`BoxTaskExecutor`](super::box_executor::BoxTaskExecutor).
pub trait TaskExecutor: Send + Sync {
    /// Kind identifier matched against `TaskTemplate::kind`.
    fn kind(&self) -> &str;

    /// Perform one attempt.
    ///
    /// Implementations should watch `cancel` at their own suspension points
    /// and return [`ExecutorFailure::Cancelled`] once it fires.
    fn execute(
        &self,
        invocation: TaskInvocation,
        cancel: CancellationToken,
    ) -> impl std::future::Future<Output = Result<Value, ExecutorFailure>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_classification() {
        assert!(ExecutorFailure::retryable("503").is_retryable());
        assert!(!ExecutorFailure::fatal("bad input").is_retryable());
        assert!(!ExecutorFailure::Cancelled.is_retryable());
    }

    #[test]
    fn failure_display() {
        assert_eq!(
            ExecutorFailure::fatal("bad input").to_string(),
            "fatal failure: bad input"
        );
        assert_eq!(ExecutorFailure::Cancelled.to_string(), "cancelled");
    }
}
