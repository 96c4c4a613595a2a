//! Executor registry: task kind -> executor.
//!
//! Built once at process start and shared immutably behind `Arc`.

use std::collections::HashMap;
use std::sync::Arc;

use super::box_executor::BoxTaskExecutor;
use super::executor::TaskExecutor;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("no executor registered for kind '{0}'")]
    NotFound(String),
}

#[derive(Debug, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<BoxTaskExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor under its own `kind()`, replacing any previous one.
    pub fn register<T: TaskExecutor + 'static>(&mut self, executor: T) -> &mut Self {
        let boxed = BoxTaskExecutor::new(executor);
        let kind = boxed.kind().to_string();
        if self.executors.insert(kind.clone(), Arc::new(boxed)).is_some() {
            tracing::debug!(kind = kind.as_str(), "replaced registered executor");
        }
        self
    }

    /// Builder-style [`register`](Self::register).
    pub fn with<T: TaskExecutor + 'static>(mut self, executor: T) -> Self {
        self.register(executor);
        self
    }

    pub fn resolve(&self, kind: &str) -> Result<Arc<BoxTaskExecutor>, RegistryError> {
        self.executors
            .get(kind)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(kind.to_string()))
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.executors.contains_key(kind)
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.executors.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}
