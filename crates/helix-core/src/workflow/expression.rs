//! Task expression engine: drives one task instance through its lifecycle.
//!
//! ```text
//! Quiescent -> Expressing -> Expressed | Dysregulated | Terminated
//! Quiescent -> Skipped | Dysregulated | Terminated
//! ```
//!
//! One `TaskRun` is recorded per attempt. A retryable failure ends the
//! attempt's run as `Dysregulated` with `retry_scheduled`, waits out the
//! jittered backoff, and starts a fresh `Quiescent` run for the next attempt.
//! A panicking executor fails the current attempt fatally.
//! Every transition goes through the [`RunJournal`].

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use helix_types::config::EngineConfig;
use helix_types::event::DomainEvent;
use helix_types::execution::{ExpressionResult, ExpressionStatus, TaskRun};
use helix_types::workflow::{TaskInstance, TaskMode, TaskTemplate};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::event::EventPublisher;
use crate::repository::ExecutionRecordStore;

use super::backoff::BackoffStrategy;
use super::box_executor::BoxTaskExecutor;
use super::condition::ConditionEvaluator;
use super::executor::{ExecutorFailure, TaskInvocation};
use super::journal::RunJournal;
use super::registry::ExecutorRegistry;
use super::validator::validate_task;

// ---------------------------------------------------------------------------
// TaskOutcome
// ---------------------------------------------------------------------------

/// Final state of one task after the engine is done with it.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub task_id: Uuid,
    pub task_name: String,
    /// Status of the last run.
    pub status: ExpressionStatus,
    /// Number of runs that reached `Expressing`.
    pub attempts: u32,
    /// Every run created for the task, in attempt order.
    pub runs: Vec<TaskRun>,
    pub result: Option<ExpressionResult>,
    pub messages: Vec<String>,
}

impl TaskOutcome {
    /// Output of a successful final attempt.
    pub fn output(&self) -> Option<&Value> {
        self.result
            .as_ref()
            .filter(|r| r.success)
            .and_then(|r| r.output.as_ref())
    }
}

/// How a single attempt ended.
enum Attempt {
    Succeeded(Value),
    Failed { error: String, retryable: bool },
    Cancelled,
}

// ---------------------------------------------------------------------------
// TaskExpressionEngine
// ---------------------------------------------------------------------------

pub struct TaskExpressionEngine<S: ExecutionRecordStore, P: EventPublisher> {
    registry: Arc<ExecutorRegistry>,
    evaluator: Arc<ConditionEvaluator>,
    config: Arc<EngineConfig>,
    journal: Arc<RunJournal<S, P>>,
}

impl<S: ExecutionRecordStore, P: EventPublisher> Clone for TaskExpressionEngine<S, P> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            evaluator: Arc::clone(&self.evaluator),
            config: Arc::clone(&self.config),
            journal: Arc::clone(&self.journal),
        }
    }
}

impl<S: ExecutionRecordStore, P: EventPublisher> TaskExpressionEngine<S, P> {
    pub fn new(
        registry: Arc<ExecutorRegistry>,
        evaluator: Arc<ConditionEvaluator>,
        config: Arc<EngineConfig>,
        journal: Arc<RunJournal<S, P>>,
    ) -> Self {
        Self {
            registry,
            evaluator,
            config,
            journal,
        }
    }

    /// Express `task` starting from its `Quiescent` first run.
    ///
    /// `context` is the expression context conditions and executors see.
    /// Never fails: every problem ends in a terminal run status.
    pub async fn express(
        &self,
        task: &TaskInstance,
        template: Option<&TaskTemplate>,
        mut run: TaskRun,
        context: &Value,
        cancel: &CancellationToken,
    ) -> TaskOutcome {
        let mut outcome = TaskOutcome {
            task_id: task.id,
            task_name: task.name.clone(),
            status: run.status,
            attempts: 0,
            runs: Vec::new(),
            result: None,
            messages: Vec::new(),
        };

        if cancel.is_cancelled() {
            self.settle(&mut run, ExpressionStatus::Terminated, "execution cancelled before task started")
                .await;
            return finish(outcome, run);
        }

        if let Some(condition) = &task.condition {
            match self.evaluator.evaluate(condition, context) {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(task_id = %task.id, condition = condition.as_str(), "task condition false");
                    self.transition(&mut run, ExpressionStatus::Skipped).await;
                    outcome
                        .messages
                        .push(format!("task '{}' skipped: condition is false", task.name));
                    return finish(outcome, run);
                }
                Err(e) => {
                    let message = format!("task '{}' condition failed: {e}", task.name);
                    self.settle(&mut run, ExpressionStatus::Dysregulated, &message).await;
                    outcome.messages.push(message);
                    return finish(outcome, run);
                }
            }
        }

        let Some(template) = template else {
            let message = format!(
                "task '{}' references unknown template {}",
                task.name, task.template_id
            );
            self.settle(&mut run, ExpressionStatus::Dysregulated, &message).await;
            outcome.messages.push(message);
            return finish(outcome, run);
        };
        run.kind = Some(template.kind.clone());

        let executor = match self.registry.resolve(&template.kind) {
            Ok(executor) => executor,
            Err(e) => {
                let message = format!("task '{}': {e}", task.name);
                self.settle(&mut run, ExpressionStatus::Dysregulated, &message).await;
                outcome.messages.push(message);
                return finish(outcome, run);
            }
        };

        let report = validate_task(task, template);
        if !report.valid {
            self.settle(&mut run, ExpressionStatus::Dysregulated, &report.summary())
                .await;
            outcome.messages.extend(report.messages);
            return finish(outcome, run);
        }

        let policy = task
            .retry
            .clone()
            .unwrap_or_else(|| self.config.default_retry.clone());
        let max_attempts = policy.max_attempts.max(1);
        let backoff = BackoffStrategy::from_policy(&policy);
        let timeout = Duration::from_secs(task.timeout_secs.unwrap_or(self.config.task_timeout_secs));

        loop {
            self.transition(&mut run, ExpressionStatus::Expressing).await;
            outcome.attempts += 1;

            let attempt = match task.configuration.mode {
                TaskMode::DryRun => Attempt::Succeeded(json!({ "dry_run": true })),
                TaskMode::Execute => {
                    self.invoke(&executor, task, template, &run, context, timeout, cancel)
                        .await
                }
            };

            match attempt {
                Attempt::Succeeded(output) => {
                    run.result = Some(ExpressionResult::success(output, run.attempt));
                    self.transition(&mut run, ExpressionStatus::Expressed).await;
                    break;
                }
                Attempt::Cancelled => {
                    run.result = Some(ExpressionResult::failure("cancelled", run.attempt));
                    run.error = Some("cancelled".to_string());
                    self.transition(&mut run, ExpressionStatus::Terminated).await;
                    outcome
                        .messages
                        .push(format!("task '{}' terminated by cancellation", task.name));
                    break;
                }
                Attempt::Failed { error, retryable } => {
                    run.result = Some(ExpressionResult::failure(error.clone(), run.attempt));
                    run.error = Some(error.clone());

                    if !retryable || run.attempt >= max_attempts {
                        self.transition(&mut run, ExpressionStatus::Dysregulated).await;
                        outcome.messages.push(format!(
                            "task '{}' failed after {} attempt(s): {error}",
                            task.name, run.attempt
                        ));
                        break;
                    }

                    run.retry_scheduled = true;
                    self.transition(&mut run, ExpressionStatus::Dysregulated).await;

                    let delay = backoff.get_delay(run.attempt - 1);
                    tracing::debug!(
                        task_id = %task.id,
                        attempt = run.attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = error.as_str(),
                        "scheduling retry"
                    );
                    self.journal
                        .publish(DomainEvent::TaskRetryScheduled {
                            execution_id: run.execution_id,
                            task_id: task.id,
                            failed_attempt: run.attempt,
                            next_attempt: run.attempt + 1,
                            delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            error,
                        })
                        .await;

                    let next = run.next_attempt();
                    outcome.runs.push(std::mem::replace(&mut run, next));
                    self.journal.save_task_run(&run).await;

                    tokio::select! {
                        _ = cancel.cancelled() => {
                            self.settle(&mut run, ExpressionStatus::Terminated, "cancelled during retry backoff").await;
                            outcome
                                .messages
                                .push(format!("task '{}' terminated by cancellation", task.name));
                            break;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        finish(outcome, run)
    }

    /// Invoke the executor once, racing its timeout and the cancellation token.
    #[allow(clippy::too_many_arguments)]
    async fn invoke(
        &self,
        executor: &BoxTaskExecutor,
        task: &TaskInstance,
        template: &TaskTemplate,
        run: &TaskRun,
        context: &Value,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Attempt {
        let invocation = TaskInvocation {
            execution_id: run.execution_id,
            task_id: task.id,
            run_id: run.id,
            task_name: task.name.clone(),
            kind: template.kind.clone(),
            operation: task.configuration.operation.clone(),
            mode: task.configuration.mode,
            attempt: run.attempt,
            parameters: task.parameters.clone(),
            run_in_parallel: task.configuration.run_in_parallel,
            priority: task.configuration.priority,
            context: context.clone(),
        };

        let call = AssertUnwindSafe(executor.execute(invocation, cancel.child_token())).catch_unwind();
        tokio::pin!(call);

        let settled = tokio::select! {
            res = tokio::time::timeout(timeout, &mut call) => Some(res),
            _ = cancel.cancelled() => None,
        };

        match settled {
            Some(Ok(Ok(Ok(output)))) => Attempt::Succeeded(output),
            Some(Ok(Ok(Err(ExecutorFailure::Retryable(error))))) => Attempt::Failed {
                error,
                retryable: true,
            },
            Some(Ok(Ok(Err(ExecutorFailure::Fatal(error))))) => Attempt::Failed {
                error,
                retryable: false,
            },
            Some(Ok(Ok(Err(ExecutorFailure::Cancelled)))) => Attempt::Cancelled,
            Some(Ok(Err(panic))) => {
                tracing::error!(
                    task_id = %task.id,
                    run_id = %run.id,
                    attempt = run.attempt,
                    panic = panic_message(panic.as_ref()),
                    "executor panicked"
                );
                Attempt::Failed {
                    error: "executor panicked".to_string(),
                    retryable: false,
                }
            }
            Some(Err(_elapsed)) => Attempt::Failed {
                error: format!("timed out after {}s", timeout.as_secs()),
                retryable: true,
            },
            None => {
                let grace = Duration::from_millis(self.config.cancellation_grace_ms);
                if tokio::time::timeout(grace, &mut call).await.is_err() {
                    tracing::debug!(
                        task_id = %task.id,
                        run_id = %run.id,
                        "executor did not settle within cancellation grace"
                    );
                }
                Attempt::Cancelled
            }
        }
    }

    async fn transition(&self, run: &mut TaskRun, next: ExpressionStatus) {
        match run.transition(next) {
            Ok(prior) => self.journal.task_run_transitioned(run, prior).await,
            Err(e) => tracing::warn!(run_id = %run.id, error = %e, "rejected task run transition"),
        }
    }

    /// Terminal transition with an error note.
    async fn settle(&self, run: &mut TaskRun, next: ExpressionStatus, error: &str) {
        run.error = Some(error.to_string());
        self.transition(run, next).await;
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

fn finish(mut outcome: TaskOutcome, run: TaskRun) -> TaskOutcome {
    outcome.status = run.status;
    outcome.result = run.result.clone();
    outcome.runs.push(run);
    outcome
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
