//! Built-in task executors.
//!
//! - `echo` -- returns its parameters unchanged
//! - `sleep` -- waits `duration_ms` milliseconds, observing cancellation

use std::time::Duration;

use helix_core::workflow::executor::{ExecutorFailure, TaskExecutor, TaskInvocation};
use helix_core::workflow::registry::ExecutorRegistry;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

/// Registry with every built-in executor.
pub fn builtin_registry() -> ExecutorRegistry {
    ExecutorRegistry::new().with(EchoExecutor).with(SleepExecutor)
}

// ---------------------------------------------------------------------------
// echo
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct EchoExecutor;

impl TaskExecutor for EchoExecutor {
    fn kind(&self) -> &str {
        "echo"
    }

    async fn execute(
        &self,
        invocation: TaskInvocation,
        cancel: CancellationToken,
    ) -> Result<Value, ExecutorFailure> {
        if cancel.is_cancelled() {
            return Err(ExecutorFailure::Cancelled);
        }
        tracing::debug!(task = invocation.task_name.as_str(), "echo");
        Ok(Value::Object(invocation.parameters))
    }
}

// ---------------------------------------------------------------------------
// sleep
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct SleepExecutor;

impl TaskExecutor for SleepExecutor {
    fn kind(&self) -> &str {
        "sleep"
    }

    async fn execute(
        &self,
        invocation: TaskInvocation,
        cancel: CancellationToken,
    ) -> Result<Value, ExecutorFailure> {
        let duration_ms = match invocation.parameters.get("duration_ms") {
            None | Some(Value::Null) => 0,
            Some(value) => value.as_u64().ok_or_else(|| {
                ExecutorFailure::fatal(format!(
                    "duration_ms must be a non-negative integer, got {value}"
                ))
            })?,
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(ExecutorFailure::Cancelled),
            _ = tokio::time::sleep(Duration::from_millis(duration_ms)) => {
                Ok(json!({ "slept_ms": duration_ms }))
            }
        }
    }
}
