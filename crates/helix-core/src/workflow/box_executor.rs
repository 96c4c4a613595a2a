//! BoxTaskExecutor -- object-safe dynamic dispatch wrapper for TaskExecutor.
//!
//! 1. Define an object-safe `TaskExecutorDyn` trait with boxed futures
//! 2. Blanket-impl `TaskExecutorDyn` for all `T: TaskExecutor`
//! 3. `BoxTaskExecutor` wraps `Box<dyn TaskExecutorDyn>` and delegates

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::executor::{ExecutorFailure, TaskExecutor, TaskInvocation};

/// Object-safe version of [`TaskExecutor`] with boxed futures.
pub trait TaskExecutorDyn: Send + Sync {
    fn kind(&self) -> &str;

    fn execute_boxed<'a>(
        &'a self,
        invocation: TaskInvocation,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<Value, ExecutorFailure>> + Send + 'a>>;
}

impl<T: TaskExecutor> TaskExecutorDyn for T {
    fn kind(&self) -> &str {
        TaskExecutor::kind(self)
    }

    fn execute_boxed<'a>(
        &'a self,
        invocation: TaskInvocation,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<Value, ExecutorFailure>> + Send + 'a>> {
        Box::pin(self.execute(invocation, cancel))
    }
}

/// Type-erased task executor for registry lookup by kind.
///
/// Since `TaskExecutor` uses RPITIT, it cannot be used as a trait object
/// directly. `BoxTaskExecutor` provides equivalent methods that delegate to
/// the inner `TaskExecutorDyn` trait object.
pub struct BoxTaskExecutor {
    inner: Box<dyn TaskExecutorDyn + Send + Sync>,
}

impl BoxTaskExecutor {
    pub fn new<T: TaskExecutor + 'static>(executor: T) -> Self {
        Self {
            inner: Box::new(executor),
        }
    }

    pub fn kind(&self) -> &str {
        self.inner.kind()
    }

    pub async fn execute(
        &self,
        invocation: TaskInvocation,
        cancel: CancellationToken,
    ) -> Result<Value, ExecutorFailure> {
        self.inner.execute_boxed(invocation, cancel).await
    }
}

impl std::fmt::Debug for BoxTaskExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxTaskExecutor")
            .field("kind", &self.kind())
            .finish()
    }
}
