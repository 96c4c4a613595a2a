//! Run middleware: decorators around the orchestrator entry point.
//!
//! Layers implement [`WorkflowRunner`] and wrap another runner:
//!
//! ```text
//! ErrorTranslation -> Instrumented -> Orchestrator
//! ```
//!
//! [`compose`] builds that stack. Callers of the composed runner always get a
//! `RunReport` with a terminal status.

use std::sync::Arc;
use std::time::Instant;

use helix_types::execution::{ExecutionStatus, WorkflowExecution};
use tracing::{Instrument, info_span};

use crate::event::EventPublisher;
use crate::repository::ExecutionRecordStore;

use super::orchestrator::{EngineError, Orchestrator, RunReport, RunRequest, initial_stage_reports};

/// Anything that can run a workflow request to completion.
pub trait WorkflowRunner: Send + Sync {
    fn run(
        &self,
        request: RunRequest,
    ) -> impl std::future::Future<Output = Result<RunReport, EngineError>> + Send;
}

impl<S, P> WorkflowRunner for Orchestrator<S, P>
where
    S: ExecutionRecordStore + 'static,
    P: EventPublisher + 'static,
{
    async fn run(&self, request: RunRequest) -> Result<RunReport, EngineError> {
        self.execute(request).await
    }
}

impl<R: WorkflowRunner> WorkflowRunner for Arc<R> {
    async fn run(&self, request: RunRequest) -> Result<RunReport, EngineError> {
        self.as_ref().run(request).await
    }
}

// ---------------------------------------------------------------------------
// Instrumentation
// ---------------------------------------------------------------------------

/// Runs the inner runner inside a `workflow.run` span and logs the outcome
/// with its duration.
#[derive(Debug, Clone)]
pub struct Instrumented<R> {
    inner: R,
}

impl<R> Instrumented<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }
}

impl<R: WorkflowRunner> WorkflowRunner for Instrumented<R> {
    async fn run(&self, request: RunRequest) -> Result<RunReport, EngineError> {
        let span = info_span!(
            "workflow.run",
            workflow.id = %request.definition.id,
            workflow.name = request.definition.name.as_str(),
            workflow.version = request.definition.version.as_str(),
            execution.id = %request.execution_id,
            tenant.id = %request.tenant_id,
        );
        let started = Instant::now();

        let result = self.inner.run(request).instrument(span.clone()).await;
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        span.in_scope(|| match &result {
            Ok(report) => tracing::info!(
                status = %report.status(),
                elapsed_ms,
                warnings = report.warnings.len(),
                "workflow run finished"
            ),
            Err(e) => tracing::error!(error = %e, elapsed_ms, "workflow run failed"),
        });
        result
    }
}

// ---------------------------------------------------------------------------
// Error translation
// ---------------------------------------------------------------------------

/// Turns an engine error into a `Faulted` report carrying the error message.
///
/// The orchestrator only errors for requests it rejects before persisting
/// anything, so the translated report is returned but not stored or
/// published.
#[derive(Debug, Clone)]
pub struct ErrorTranslation<R> {
    inner: R,
}

impl<R> ErrorTranslation<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }
}

impl<R: WorkflowRunner> WorkflowRunner for ErrorTranslation<R> {
    async fn run(&self, request: RunRequest) -> Result<RunReport, EngineError> {
        let mut execution = WorkflowExecution::new(
            request.execution_id,
            &request.definition,
            request.user_id,
            request.input.clone(),
        );
        let stages = initial_stage_reports(&request.definition);

        match self.inner.run(request).await {
            Ok(report) => Ok(report),
            Err(e) => {
                // Idle -> Faulted is always a legal edge.
                execution.transition(ExecutionStatus::Faulted)?;
                execution.messages.push(e.to_string());
                Ok(RunReport {
                    messages: execution.messages.clone(),
                    execution,
                    stages,
                    warnings: Vec::new(),
                })
            }
        }
    }
}

/// The standard stack: error translation around instrumentation around `runner`.
pub fn compose<R: WorkflowRunner>(runner: R) -> ErrorTranslation<Instrumented<R>> {
    ErrorTranslation::new(Instrumented::new(runner))
}
