//! Engine configuration types for Helix.
//!
//! `EngineConfig` represents `helix.toml`, which controls retry defaults,
//! timeouts, cancellation grace, and concurrency admission.

use serde::{Deserialize, Serialize};

use crate::workflow::RetryPolicy;

/// Top-level configuration for the workflow engine.
///
/// Loaded from `{HELIX_HOME}/helix.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Retry policy for tasks that declare none.
    #[serde(default)]
    pub default_retry: RetryPolicy,

    /// Per-attempt timeout for tasks that declare none.
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,

    /// How long a cancelled executor may take to settle before its run is terminated.
    #[serde(default = "default_cancellation_grace_ms")]
    pub cancellation_grace_ms: u64,

    /// Maximum executions running at once. `None` means unbounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_executions: Option<usize>,

    /// Capacity of the in-process event bus.
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,
}

fn default_task_timeout_secs() -> u64 {
    300
}

fn default_cancellation_grace_ms() -> u64 {
    250
}

fn default_event_bus_capacity() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_retry: RetryPolicy::default(),
            task_timeout_secs: default_task_timeout_secs(),
            cancellation_grace_ms: default_cancellation_grace_ms(),
            max_concurrent_executions: None,
            event_bus_capacity: default_event_bus_capacity(),
        }
    }
}
