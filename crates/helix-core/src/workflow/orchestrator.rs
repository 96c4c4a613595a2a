//! Workflow execution orchestrator.
//!
//! Drives a `WorkflowExecution` through
//! `Idle -> Running -> Completed | Faulted | Terminated` (or straight from
//! `Idle` to `Skipped`, `Faulted` or `Terminated`) by walking the stages of
//! a definition in priority order.
//!
//! # Execution flow
//!
//! 1. Acquire an admission permit (when `max_concurrent_executions` is set).
//! 2. Create the `Idle` execution and one `Quiescent` run per task.
//! 3. Validate the definition and the request scope; failure -> `Faulted`.
//! 4. Evaluate the workflow condition; false -> `Skipped`.
//! 5. For each stage, express its tasks sequentially or on a `JoinSet`.
//! 6. Fold stage results into the final status and return a `RunReport`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use helix_types::config::EngineConfig;
use helix_types::error::TransitionError;
use helix_types::event::DomainEvent;
use helix_types::execution::{
    ExecutionStatus, ExpressionStatus, StageReport, StageStatus, TaskRun, WorkflowExecution,
};
use helix_types::workflow::{Stage, TaskTemplate, WorkflowBundle, WorkflowDefinition};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::event::EventPublisher;
use crate::repository::ExecutionRecordStore;

use super::condition::ConditionEvaluator;
use super::context::RunContext;
use super::expression::{TaskExpressionEngine, TaskOutcome};
use super::journal::{CollaboratorWarning, RunJournal};
use super::plan::order_stages;
use super::registry::ExecutorRegistry;
use super::validator::validate_workflow;

// ---------------------------------------------------------------------------
// RunRequest
// ---------------------------------------------------------------------------

/// Everything needed to start one execution.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Assigned up front so callers can cancel before the run returns.
    pub execution_id: Uuid,
    pub definition: WorkflowDefinition,
    pub templates: HashMap<Uuid, TaskTemplate>,
    /// Tenant the caller acts for; must match the definition.
    pub tenant_id: Uuid,
    pub user_id: Option<Uuid>,
    pub input: Value,
    pub cancellation: Option<CancellationToken>,
}

impl RunRequest {
    pub fn new(
        definition: WorkflowDefinition,
        templates: impl IntoIterator<Item = TaskTemplate>,
    ) -> Self {
        Self {
            execution_id: Uuid::now_v7(),
            tenant_id: definition.tenant_id,
            templates: templates.into_iter().map(|t| (t.id, t)).collect(),
            definition,
            user_id: None,
            input: Value::Object(Default::default()),
            cancellation: None,
        }
    }

    pub fn from_bundle(bundle: WorkflowBundle) -> Self {
        Self::new(bundle.definition, bundle.templates)
    }

    pub fn with_tenant(mut self, tenant_id: Uuid) -> Self {
        self.tenant_id = tenant_id;
        self
    }

    pub fn with_user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

// ---------------------------------------------------------------------------
// RunReport
// ---------------------------------------------------------------------------

/// Outcome of one execution as seen by the caller.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub execution: WorkflowExecution,
    /// Stages in execution order.
    pub stages: Vec<StageReport>,
    pub messages: Vec<String>,
    pub warnings: Vec<CollaboratorWarning>,
}

impl RunReport {
    pub fn status(&self) -> ExecutionStatus {
        self.execution.status
    }

    /// True when a store or publisher call failed during the run.
    pub fn is_degraded(&self) -> bool {
        !self.warnings.is_empty()
    }

    pub fn stage(&self, stage_id: Uuid) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.stage_id == stage_id)
    }

    /// Latest run of a task.
    pub fn task_run(&self, task_id: Uuid) -> Option<&TaskRun> {
        self.execution.latest_run_for(task_id)
    }
}

/// Stage reports for a definition, all `NotStarted`, in execution order.
pub fn initial_stage_reports(definition: &WorkflowDefinition) -> Vec<StageReport> {
    order_stages(&definition.stages)
        .into_iter()
        .map(|stage| StageReport {
            stage_id: stage.id,
            name: stage.name.clone(),
            priority: stage.priority,
            status: StageStatus::NotStarted,
            best_effort: stage.best_effort,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    #[error("concurrency limit reached ({limit} executions running)")]
    ConcurrencyLimitReached { limit: usize },

    #[error("execution {execution_id} is already running")]
    DuplicateExecution { execution_id: Uuid },
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Executes workflow definitions.
///
/// Generic over the record store and event publisher. Shared behind `Arc`
/// by callers that need to cancel executions from another task.
pub struct Orchestrator<S: ExecutionRecordStore, P: EventPublisher> {
    store: Arc<S>,
    publisher: Arc<P>,
    registry: Arc<ExecutorRegistry>,
    evaluator: Arc<ConditionEvaluator>,
    config: Arc<EngineConfig>,
    admission: Option<(usize, Arc<Semaphore>)>,
    /// Cancellation tokens keyed by execution ID.
    cancellation_tokens: DashMap<Uuid, CancellationToken>,
}

impl<S, P> Orchestrator<S, P>
where
    S: ExecutionRecordStore + 'static,
    P: EventPublisher + 'static,
{
    pub fn new(store: Arc<S>, publisher: Arc<P>, registry: ExecutorRegistry, config: EngineConfig) -> Self {
        let admission = config
            .max_concurrent_executions
            .map(|limit| (limit, Arc::new(Semaphore::new(limit))));
        Self {
            store,
            publisher,
            registry: Arc::new(registry),
            evaluator: Arc::new(ConditionEvaluator::new()),
            config: Arc::new(config),
            admission,
            cancellation_tokens: DashMap::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &ExecutorRegistry {
        &self.registry
    }

    /// Request cancellation of a running execution. Returns `false` if no
    /// execution with that ID is running.
    pub fn cancel(&self, execution_id: Uuid) -> bool {
        match self.cancellation_tokens.get(&execution_id) {
            Some(token) => {
                token.cancel();
                tracing::info!(execution_id = %execution_id, "execution cancellation requested");
                true
            }
            None => false,
        }
    }

    /// IDs of executions currently running.
    pub fn active_executions(&self) -> Vec<Uuid> {
        self.cancellation_tokens.iter().map(|e| *e.key()).collect()
    }

    fn acquire_admission_permit(&self) -> Result<Option<OwnedSemaphorePermit>, EngineError> {
        match &self.admission {
            Some((limit, semaphore)) => Arc::clone(semaphore)
                .try_acquire_owned()
                .map(Some)
                .map_err(|_| EngineError::ConcurrencyLimitReached { limit: *limit }),
            None => Ok(None),
        }
    }

    /// Claim the execution ID. The token is released when the guard drops,
    /// including when the run future is dropped mid-flight.
    fn register(
        &self,
        execution_id: Uuid,
        token: CancellationToken,
    ) -> Result<ActiveExecution<'_>, EngineError> {
        match self.cancellation_tokens.entry(execution_id) {
            Entry::Occupied(_) => Err(EngineError::DuplicateExecution { execution_id }),
            Entry::Vacant(slot) => {
                slot.insert(token);
                Ok(ActiveExecution {
                    tokens: &self.cancellation_tokens,
                    execution_id,
                })
            }
        }
    }

    /// Run one execution to a terminal status.
    ///
    /// Errors are returned only for requests rejected before anything is
    /// persisted (admission limit, duplicate execution ID). Failures after
    /// that point end in a `Faulted` report.
    pub async fn execute(&self, request: RunRequest) -> Result<RunReport, EngineError> {
        let _permit = self.acquire_admission_permit()?;

        let token = request
            .cancellation
            .clone()
            .unwrap_or_else(CancellationToken::new);
        let _active = self.register(request.execution_id, token.clone())?;

        self.drive(request, token).await
    }

    async fn drive(
        &self,
        request: RunRequest,
        token: CancellationToken,
    ) -> Result<RunReport, EngineError> {
        let RunRequest {
            execution_id,
            definition,
            templates,
            tenant_id,
            user_id,
            input,
            ..
        } = request;

        let journal = Arc::new(RunJournal::new(
            Arc::clone(&self.store),
            Arc::clone(&self.publisher),
        ));
        let mut run = ExecutionState {
            execution: WorkflowExecution::new(execution_id, &definition, user_id, input.clone()),
            stages: initial_stage_reports(&definition),
            journal: Arc::clone(&journal),
        };

        for (stage, task) in definition.tasks() {
            let task_run = TaskRun::new(
                execution_id,
                task.tenant_id,
                stage.id,
                task.id,
                task.name.clone(),
                1,
                task.parameters.clone(),
            );
            run.execution.upsert_task_run(&task_run);
        }
        journal.save_execution(&run.execution).await;
        for task_run in &run.execution.task_runs {
            journal.save_task_run(task_run).await;
        }

        tracing::info!(
            execution_id = %execution_id,
            workflow = definition.name.as_str(),
            version = definition.version.as_str(),
            tasks = run.execution.task_runs.len(),
            "starting workflow execution"
        );

        // Preflight
        let mut report = validate_workflow(&definition, &templates);
        if tenant_id != definition.tenant_id {
            report.fail(format!(
                "request tenant {tenant_id} does not match workflow tenant {}",
                definition.tenant_id
            ));
        }
        if !report.valid {
            tracing::warn!(
                execution_id = %execution_id,
                problems = report.messages.len(),
                "workflow validation failed"
            );
            for task_id in &report.invalid_tasks {
                run.settle_pending(*task_id, ExpressionStatus::Dysregulated, "task failed validation")
                    .await;
            }
            journal
                .publish(DomainEvent::ValidationFailed {
                    execution_id,
                    workflow_id: definition.id,
                    messages: report.messages.clone(),
                })
                .await;
            run.execution.messages.extend(report.messages);
            return run.finish(ExecutionStatus::Faulted).await;
        }

        // Gate
        let mut context = RunContext::new(execution_id, definition.name.clone(), input);
        if let Some(condition) = &definition.condition {
            match self
                .evaluator
                .evaluate(condition, &context.to_expression_context())
            {
                Ok(true) => {}
                Ok(false) => {
                    let task_ids: Vec<Uuid> = definition.tasks().map(|(_, t)| t.id).collect();
                    for task_id in task_ids {
                        run.settle_pending(task_id, ExpressionStatus::Skipped, "workflow condition is false")
                            .await;
                    }
                    run.execution
                        .messages
                        .push(format!("workflow '{}' skipped: condition is false", definition.name));
                    return run.finish(ExecutionStatus::Skipped).await;
                }
                Err(e) => {
                    run.execution
                        .messages
                        .push(format!("workflow '{}' condition failed: {e}", definition.name));
                    return run.finish(ExecutionStatus::Faulted).await;
                }
            }
        }

        if token.is_cancelled() {
            run.execution
                .messages
                .push("execution cancelled before start".to_string());
            return run.finish(ExecutionStatus::Terminated).await;
        }

        run.transition(ExecutionStatus::Running).await?;

        let engine = TaskExpressionEngine::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.evaluator),
            Arc::clone(&self.config),
            Arc::clone(&journal),
        );
        let templates = Arc::new(templates);

        let mut faulted = false;
        let mut terminated = false;

        for (index, stage) in order_stages(&definition.stages).into_iter().enumerate() {
            if token.is_cancelled() {
                terminated = true;
                break;
            }

            tracing::debug!(
                execution_id = %execution_id,
                stage = stage.name.as_str(),
                parallel = stage.run_in_parallel,
                tasks = stage.tasks.len(),
                "processing stage"
            );

            let status = if stage.run_in_parallel {
                run_parallel_stage(&engine, &mut run, &mut context, stage, &templates, &token).await
            } else {
                run_sequential_stage(&engine, &mut run, &mut context, stage, &templates, &token).await
            };

            run.stages[index].status = status;
            journal
                .publish(DomainEvent::StageCompleted {
                    execution_id,
                    stage_id: stage.id,
                    stage_name: stage.name.clone(),
                    faulted: status == StageStatus::Faulted,
                    terminated: status == StageStatus::Terminated,
                })
                .await;

            match status {
                StageStatus::Terminated => {
                    terminated = true;
                    break;
                }
                StageStatus::Faulted if stage.best_effort => {
                    faulted = true;
                    run.execution.messages.push(format!(
                        "stage '{}' faulted; continuing (best effort)",
                        stage.name
                    ));
                }
                StageStatus::Faulted => {
                    faulted = true;
                    run.execution
                        .messages
                        .push(format!("stage '{}' faulted; halting", stage.name));
                    break;
                }
                StageStatus::Completed | StageStatus::NotStarted => {}
            }
        }

        let final_status = if terminated {
            run.execution.messages.push("execution cancelled".to_string());
            ExecutionStatus::Terminated
        } else if faulted {
            ExecutionStatus::Faulted
        } else {
            ExecutionStatus::Completed
        };

        run.finish(final_status).await
    }
}

/// Registration of a running execution in the token map.
struct ActiveExecution<'a> {
    tokens: &'a DashMap<Uuid, CancellationToken>,
    execution_id: Uuid,
}

impl Drop for ActiveExecution<'_> {
    fn drop(&mut self) {
        self.tokens.remove(&self.execution_id);
    }
}

// ---------------------------------------------------------------------------
// Stage execution
// ---------------------------------------------------------------------------

/// Express tasks one at a time in declaration order. A `Dysregulated` task
/// aborts the rest of the stage, leaving them `Quiescent`.
async fn run_sequential_stage<S, P>(
    engine: &TaskExpressionEngine<S, P>,
    run: &mut ExecutionState<S, P>,
    context: &mut RunContext,
    stage: &Stage,
    templates: &HashMap<Uuid, TaskTemplate>,
    token: &CancellationToken,
) -> StageStatus
where
    S: ExecutionRecordStore + 'static,
    P: EventPublisher + 'static,
{
    for task in &stage.tasks {
        if token.is_cancelled() {
            return StageStatus::Terminated;
        }
        let Some(first) = run.execution.latest_run_for(task.id).cloned() else {
            continue;
        };

        let outcome = engine
            .express(
                task,
                templates.get(&task.template_id),
                first,
                &context.to_expression_context(),
                token,
            )
            .await;
        run.absorb(context, &outcome);

        match outcome.status {
            ExpressionStatus::Terminated => return StageStatus::Terminated,
            ExpressionStatus::Dysregulated => return StageStatus::Faulted,
            _ => {}
        }
    }
    StageStatus::Completed
}

/// Express every task concurrently. Siblings are never cancelled because
/// one of them failed; tasks see the context as of stage start.
async fn run_parallel_stage<S, P>(
    engine: &TaskExpressionEngine<S, P>,
    run: &mut ExecutionState<S, P>,
    context: &mut RunContext,
    stage: &Stage,
    templates: &Arc<HashMap<Uuid, TaskTemplate>>,
    token: &CancellationToken,
) -> StageStatus
where
    S: ExecutionRecordStore + 'static,
    P: EventPublisher + 'static,
{
    let snapshot = context.to_expression_context();
    let mut join_set = JoinSet::new();
    let mut pending: HashSet<Uuid> = HashSet::new();

    for task in &stage.tasks {
        let Some(first) = run.execution.latest_run_for(task.id).cloned() else {
            continue;
        };
        pending.insert(task.id);

        let engine = engine.clone();
        let task = task.clone();
        let templates = Arc::clone(templates);
        let snapshot = snapshot.clone();
        let token = token.clone();

        join_set.spawn(async move {
            engine
                .express(
                    &task,
                    templates.get(&task.template_id),
                    first,
                    &snapshot,
                    &token,
                )
                .await
        });
    }

    let mut any_faulted = false;
    let mut any_terminated = false;

    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok(outcome) => {
                pending.remove(&outcome.task_id);
                run.absorb(context, &outcome);
                match outcome.status {
                    ExpressionStatus::Dysregulated => any_faulted = true,
                    ExpressionStatus::Terminated => any_terminated = true,
                    _ => {}
                }
            }
            Err(e) => {
                tracing::error!(stage = stage.name.as_str(), error = %e, "task expression aborted");
                any_faulted = true;
            }
        }
    }

    // Executor panics are settled by the engine; an outcome only goes
    // missing when the expression task itself died.
    for task_id in pending {
        run.settle_pending(task_id, ExpressionStatus::Dysregulated, "task expression aborted")
            .await;
    }

    if any_terminated || token.is_cancelled() {
        StageStatus::Terminated
    } else if any_faulted {
        StageStatus::Faulted
    } else {
        StageStatus::Completed
    }
}

// ---------------------------------------------------------------------------
// ExecutionState
// ---------------------------------------------------------------------------

/// Mutable state of one execution while the orchestrator drives it.
struct ExecutionState<S: ExecutionRecordStore, P: EventPublisher> {
    execution: WorkflowExecution,
    stages: Vec<StageReport>,
    journal: Arc<RunJournal<S, P>>,
}

impl<S: ExecutionRecordStore, P: EventPublisher> ExecutionState<S, P> {
    async fn transition(&mut self, next: ExecutionStatus) -> Result<(), EngineError> {
        let prior = self.execution.transition(next)?;
        self.journal
            .execution_transitioned(&self.execution, prior)
            .await;
        Ok(())
    }

    /// Move the latest run of a task that never started to a terminal status.
    async fn settle_pending(&mut self, task_id: Uuid, next: ExpressionStatus, error: &str) {
        let Some(mut task_run) = self.execution.latest_run_for(task_id).cloned() else {
            return;
        };
        let Ok(prior) = task_run.transition(next) else {
            return;
        };
        task_run.error = Some(error.to_string());
        self.execution.upsert_task_run(&task_run);
        self.journal.task_run_transitioned(&task_run, prior).await;
    }

    /// Fold a task outcome into the execution and context.
    fn absorb(&mut self, context: &mut RunContext, outcome: &TaskOutcome) {
        for task_run in &outcome.runs {
            self.execution.upsert_task_run(task_run);
        }
        if outcome.status == ExpressionStatus::Expressed {
            if let Some(output) = outcome.output() {
                context.record_output(&outcome.task_name, output.clone());
            }
        }
        self.execution.messages.extend(outcome.messages.iter().cloned());
    }

    async fn finish(mut self, status: ExecutionStatus) -> Result<RunReport, EngineError> {
        self.transition(status).await?;
        let warnings = self.journal.warnings().await;

        tracing::info!(
            execution_id = %self.execution.id,
            workflow = self.execution.workflow_name.as_str(),
            status = %status,
            warnings = warnings.len(),
            "workflow execution finished"
        );

        Ok(RunReport {
            messages: self.execution.messages.clone(),
            execution: self.execution,
            stages: self.stages,
            warnings,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use helix_types::error::{PublishError, RepositoryError};
    use helix_types::event::EventEnvelope;
    use helix_types::workflow::{RetryPolicy, TaskConfiguration, TaskInstance};
    use serde_json::{Map, json};
    use tokio::sync::Mutex;

    use crate::event::EventBus;
    use crate::workflow::executor::{ExecutorFailure, TaskExecutor, TaskInvocation};

    const TENANT: Uuid = Uuid::from_u128(0x7e);
    const TEMPLATE: Uuid = Uuid::from_u128(0x1);

    // --- fakes ---

    #[derive(Default)]
    struct RecordingStore {
        executions: Mutex<Vec<WorkflowExecution>>,
        runs: Mutex<Vec<TaskRun>>,
    }

    impl ExecutionRecordStore for RecordingStore {
        async fn save_workflow_execution(&self, execution: &WorkflowExecution) -> Result<(), RepositoryError> {
            self.executions.lock().await.push(execution.clone());
            Ok(())
        }

        async fn save_task_run(&self, run: &TaskRun) -> Result<(), RepositoryError> {
            self.runs.lock().await.push(run.clone());
            Ok(())
        }
    }

    struct BrokenStore;

    impl ExecutionRecordStore for BrokenStore {
        async fn save_workflow_execution(&self, _: &WorkflowExecution) -> Result<(), RepositoryError> {
            Err(RepositoryError::Connection)
        }

        async fn save_task_run(&self, _: &TaskRun) -> Result<(), RepositoryError> {
            Err(RepositoryError::Connection)
        }
    }

    struct BrokenPublisher;

    impl EventPublisher for BrokenPublisher {
        async fn publish(&self, envelope: EventEnvelope) -> Result<(), PublishError> {
            Err(PublishError::Unavailable(envelope.kind))
        }
    }

    /// Behaviour keyed by the `behaviour` parameter; records call order.
    struct Scripted {
        calls: Arc<StdMutex<Vec<String>>>,
    }

    impl TaskExecutor for Scripted {
        fn kind(&self) -> &str {
            "scripted"
        }

        async fn execute(
            &self,
            invocation: TaskInvocation,
            cancel: CancellationToken,
        ) -> Result<Value, ExecutorFailure> {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(invocation.task_name.clone());
            }
            let behaviour = invocation
                .parameters
                .get("behaviour")
                .and_then(|v| v.as_str())
                .unwrap_or("ok")
                .to_string();
            match behaviour.as_str() {
                "fatal" => Err(ExecutorFailure::fatal("boom")),
                "hang" => {
                    cancel.cancelled().await;
                    Err(ExecutorFailure::Cancelled)
                }
                "slow" => {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    Ok(json!({ "task": invocation.task_name }))
                }
                "panic" => panic!("executor bug"),
                "flaky_then_panic" if invocation.attempt == 1 => {
                    Err(ExecutorFailure::retryable("503"))
                }
                "flaky_then_panic" => panic!("executor bug on retry"),
                _ => Ok(json!({ "task": invocation.task_name })),
            }
        }
    }

    // --- fixtures ---

    fn template() -> TaskTemplate {
        TaskTemplate {
            id: TEMPLATE,
            tenant_id: TENANT,
            name: "scripted".to_string(),
            kind: "scripted".to_string(),
            parameters: vec![helix_types::workflow::ParameterSpec {
                name: "behaviour".to_string(),
                param_type: helix_types::workflow::ParameterType::String,
                required: false,
                description: None,
            }],
        }
    }

    fn task(name: &str, behaviour: &str) -> TaskInstance {
        let mut parameters = Map::new();
        parameters.insert("behaviour".to_string(), json!(behaviour));
        TaskInstance {
            id: Uuid::now_v7(),
            tenant_id: TENANT,
            name: name.to_string(),
            template_id: TEMPLATE,
            parameters,
            configuration: TaskConfiguration::default(),
            depends_on: vec![],
            condition: None,
            retry: Some(RetryPolicy::no_retry()),
            timeout_secs: None,
        }
    }

    fn stage(name: &str, priority: i64, parallel: bool, tasks: Vec<TaskInstance>) -> Stage {
        Stage {
            id: Uuid::now_v7(),
            name: name.to_string(),
            priority,
            run_in_parallel: parallel,
            best_effort: false,
            tasks,
        }
    }

    fn definition(stages: Vec<Stage>) -> WorkflowDefinition {
        WorkflowDefinition {
            id: Uuid::now_v7(),
            tenant_id: TENANT,
            name: "orders".to_string(),
            version: "1".to_string(),
            description: None,
            condition: None,
            stages,
            metadata: Default::default(),
        }
    }

    fn orchestrator_with<S, P>(
        store: Arc<S>,
        publisher: Arc<P>,
        config: EngineConfig,
    ) -> (Orchestrator<S, P>, Arc<StdMutex<Vec<String>>>)
    where
        S: ExecutionRecordStore + 'static,
        P: EventPublisher + 'static,
    {
        let calls = Arc::new(StdMutex::new(Vec::new()));
        let registry = ExecutorRegistry::new().with(Scripted {
            calls: calls.clone(),
        });
        let config = EngineConfig {
            cancellation_grace_ms: 20,
            ..config
        };
        (Orchestrator::new(store, publisher, registry, config), calls)
    }

    fn orchestrator() -> (
        Orchestrator<RecordingStore, EventBus>,
        Arc<RecordingStore>,
        Arc<StdMutex<Vec<String>>>,
    ) {
        let store = Arc::new(RecordingStore::default());
        let (orch, calls) = orchestrator_with(store.clone(), Arc::new(EventBus::new(256)), EngineConfig::default());
        (orch, store, calls)
    }

    fn calls_of(calls: &Arc<StdMutex<Vec<String>>>) -> Vec<String> {
        calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    // --- happy path ---

    #[tokio::test]
    async fn completes_all_stages() {
        let (orch, store, calls) = orchestrator();
        let def = definition(vec![
            stage("one", 0, false, vec![task("a", "ok"), task("b", "ok")]),
            stage("two", 1, true, vec![task("c", "ok"), task("d", "ok")]),
        ]);
        let report = orch.execute(RunRequest::new(def, [template()])).await.unwrap();

        assert_eq!(report.status(), ExecutionStatus::Completed);
        assert!(report.stages.iter().all(|s| s.status == StageStatus::Completed));
        assert_eq!(report.execution.task_runs.len(), 4);
        assert!(report
            .execution
            .task_runs
            .iter()
            .all(|r| r.status == ExpressionStatus::Expressed));
        assert_eq!(calls_of(&calls).len(), 4);
        assert!(!report.is_degraded());

        let executions = store.executions.lock().await;
        let statuses: Vec<ExecutionStatus> = executions.iter().map(|e| e.status).collect();
        assert_eq!(
            statuses,
            vec![ExecutionStatus::Idle, ExecutionStatus::Running, ExecutionStatus::Completed]
        );
        // Four precreated runs, then Expressing and Expressed for each.
        assert_eq!(store.runs.lock().await.len(), 12);
    }

    #[tokio::test]
    async fn stages_run_by_priority_then_declaration() {
        let (orch, _, calls) = orchestrator();
        let def = definition(vec![
            stage("late", 5, false, vec![task("late", "ok")]),
            stage("first-b", 1, false, vec![task("b", "ok")]),
            stage("first-a", 1, false, vec![task("a", "ok")]),
            stage("zero", 0, false, vec![task("zero", "ok")]),
        ]);
        let report = orch.execute(RunRequest::new(def, [template()])).await.unwrap();

        assert_eq!(report.status(), ExecutionStatus::Completed);
        assert_eq!(calls_of(&calls), vec!["zero", "b", "a", "late"]);
        let names: Vec<&str> = report.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["zero", "first-b", "first-a", "late"]);
    }

    #[tokio::test]
    async fn outputs_feed_later_conditions() {
        let (orch, _, calls) = orchestrator();
        let mut gated = task("gated", "ok");
        gated.condition = Some("tasks.fetch.task == 'fetch'".to_string());
        let mut skipped = task("skipped", "ok");
        skipped.condition = Some("tasks.fetch.task == 'other'".to_string());
        let def = definition(vec![
            stage("one", 0, false, vec![task("fetch", "ok")]),
            stage("two", 1, false, vec![gated.clone(), skipped.clone()]),
        ]);
        let report = orch.execute(RunRequest::new(def, [template()])).await.unwrap();

        assert_eq!(report.status(), ExecutionStatus::Completed);
        assert_eq!(report.task_run(gated.id).unwrap().status, ExpressionStatus::Expressed);
        assert_eq!(report.task_run(skipped.id).unwrap().status, ExpressionStatus::Skipped);
        assert_eq!(calls_of(&calls), vec!["fetch", "gated"]);
    }

    // --- failure propagation ---

    #[tokio::test]
    async fn sequential_fault_aborts_rest_of_stage() {
        let (orch, _, calls) = orchestrator();
        let (a, b, c) = (task("a", "fatal"), task("b", "ok"), task("c", "ok"));
        let def = definition(vec![
            stage("one", 0, false, vec![a.clone(), b.clone(), c.clone()]),
            stage("two", 1, false, vec![task("d", "ok")]),
        ]);
        let report = orch.execute(RunRequest::new(def, [template()])).await.unwrap();

        assert_eq!(report.status(), ExecutionStatus::Faulted);
        assert_eq!(report.stages[0].status, StageStatus::Faulted);
        assert_eq!(report.stages[1].status, StageStatus::NotStarted);
        assert_eq!(report.task_run(a.id).unwrap().status, ExpressionStatus::Dysregulated);
        assert_eq!(report.task_run(b.id).unwrap().status, ExpressionStatus::Quiescent);
        assert_eq!(report.task_run(c.id).unwrap().status, ExpressionStatus::Quiescent);
        assert_eq!(calls_of(&calls), vec!["a"]);
    }

    #[tokio::test]
    async fn parallel_fault_does_not_cancel_siblings() {
        let (orch, _, _) = orchestrator();
        let (a, b) = (task("a", "fatal"), task("b", "slow"));
        let def = definition(vec![stage("one", 0, true, vec![a.clone(), b.clone()])]);
        let report = orch.execute(RunRequest::new(def, [template()])).await.unwrap();

        assert_eq!(report.status(), ExecutionStatus::Faulted);
        assert_eq!(report.stages[0].status, StageStatus::Faulted);
        assert_eq!(report.task_run(a.id).unwrap().status, ExpressionStatus::Dysregulated);
        assert_eq!(report.task_run(b.id).unwrap().status, ExpressionStatus::Expressed);
        assert!(report.execution.task_runs.iter().all(|r| r.status.is_terminal()));
    }

    #[tokio::test]
    async fn best_effort_stage_continues() {
        let (orch, _, calls) = orchestrator();
        let mut first = stage("one", 0, false, vec![task("a", "fatal")]);
        first.best_effort = true;
        let def = definition(vec![first, stage("two", 1, false, vec![task("b", "ok")])]);
        let report = orch.execute(RunRequest::new(def, [template()])).await.unwrap();

        assert_eq!(report.status(), ExecutionStatus::Faulted);
        assert_eq!(report.stages[0].status, StageStatus::Faulted);
        assert_eq!(report.stages[1].status, StageStatus::Completed);
        assert_eq!(calls_of(&calls), vec!["a", "b"]);
        assert!(report.messages.iter().any(|m| m.contains("best effort")));
    }

    #[tokio::test]
    async fn panicking_executor_is_dysregulated() {
        let (orch, _, _) = orchestrator();
        let (a, b) = (task("a", "panic"), task("b", "ok"));
        let def = definition(vec![stage("one", 0, true, vec![a.clone(), b.clone()])]);
        let report = orch.execute(RunRequest::new(def, [template()])).await.unwrap();

        assert_eq!(report.status(), ExecutionStatus::Faulted);
        let run = report.task_run(a.id).unwrap();
        assert_eq!(run.status, ExpressionStatus::Dysregulated);
        assert_eq!(run.error.as_deref(), Some("executor panicked"));
        assert_eq!(report.task_run(b.id).unwrap().status, ExpressionStatus::Expressed);
    }

    #[tokio::test]
    async fn panic_in_sequential_stage_faults_the_run() {
        let (orch, store, calls) = orchestrator();
        let (a, b) = (task("a", "panic"), task("b", "ok"));
        let def = definition(vec![stage("one", 0, false, vec![a.clone(), b.clone()])]);
        let request = RunRequest::new(def, [template()]);
        let execution_id = request.execution_id;
        let report = orch.execute(request).await.unwrap();

        assert_eq!(report.status(), ExecutionStatus::Faulted);
        assert_eq!(report.stages[0].status, StageStatus::Faulted);
        let run = report.task_run(a.id).unwrap();
        assert_eq!(run.status, ExpressionStatus::Dysregulated);
        assert_eq!(run.error.as_deref(), Some("executor panicked"));
        assert_eq!(report.task_run(b.id).unwrap().status, ExpressionStatus::Quiescent);
        assert_eq!(calls_of(&calls), vec!["a"]);

        assert!(orch.active_executions().is_empty());
        assert!(!orch.cancel(execution_id));
        let executions = store.executions.lock().await;
        assert_eq!(executions.last().unwrap().status, ExecutionStatus::Faulted);
    }

    #[tokio::test]
    async fn panic_on_retry_leaves_no_run_in_flight() {
        let (orch, store, _) = orchestrator();
        let mut flaky = task("flaky", "flaky_then_panic");
        flaky.retry = Some(RetryPolicy {
            max_attempts: 3,
            initial_delay_ms: 1,
            backoff_coefficient: 0.0,
        });
        let def = definition(vec![stage("one", 0, true, vec![flaky.clone(), task("b", "ok")])]);
        let report = orch.execute(RunRequest::new(def, [template()])).await.unwrap();

        assert_eq!(report.status(), ExecutionStatus::Faulted);
        let runs: Vec<&TaskRun> = report
            .execution
            .task_runs
            .iter()
            .filter(|r| r.task_id == flaky.id)
            .collect();
        assert_eq!(runs.len(), 2);
        assert!(runs[0].retry_scheduled);
        assert_eq!(runs[0].error.as_deref(), Some("503"));
        assert_eq!(runs[1].status, ExpressionStatus::Dysregulated);
        assert_eq!(runs[1].error.as_deref(), Some("executor panicked"));

        // The last persisted write of every run is terminal.
        let saved = store.runs.lock().await;
        let mut latest: HashMap<Uuid, &TaskRun> = HashMap::new();
        for run in saved.iter() {
            latest.insert(run.id, run);
        }
        assert_eq!(latest.len(), 3);
        assert!(latest.values().all(|r| r.status.is_terminal()));
        assert!(latest.values().any(|r| r.attempt == 1 && r.retry_scheduled));
    }

    // --- cancellation ---

    #[tokio::test]
    async fn cancel_during_first_stage_terminates() {
        let (orch, _, calls) = orchestrator();
        let orch = Arc::new(orch);
        let (a, b) = (task("a", "hang"), task("b", "hang"));
        let later = task("later", "ok");
        let def = definition(vec![
            stage("one", 0, true, vec![a.clone(), b.clone()]),
            stage("two", 1, false, vec![later.clone()]),
            stage("three", 2, false, vec![task("last", "ok")]),
        ]);
        let request = RunRequest::new(def, [template()]);
        let execution_id = request.execution_id;

        let runner = Arc::clone(&orch);
        let handle = tokio::spawn(async move { runner.execute(request).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(orch.active_executions(), vec![execution_id]);
        assert!(orch.cancel(execution_id));

        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.status(), ExecutionStatus::Terminated);
        assert_eq!(report.stages[0].status, StageStatus::Terminated);
        assert_eq!(report.stages[1].status, StageStatus::NotStarted);
        assert_eq!(report.stages[2].status, StageStatus::NotStarted);
        assert_eq!(report.task_run(a.id).unwrap().status, ExpressionStatus::Terminated);
        assert_eq!(report.task_run(b.id).unwrap().status, ExpressionStatus::Terminated);
        assert_eq!(report.task_run(later.id).unwrap().status, ExpressionStatus::Quiescent);
        assert_eq!(calls_of(&calls).len(), 2);
        assert!(orch.active_executions().is_empty());
        assert!(!orch.cancel(execution_id));
    }

    #[tokio::test]
    async fn already_cancelled_request_never_starts() {
        let (orch, _, calls) = orchestrator();
        let token = CancellationToken::new();
        token.cancel();
        let def = definition(vec![stage("one", 0, false, vec![task("a", "ok")])]);
        let report = orch
            .execute(RunRequest::new(def, [template()]).with_cancellation(token))
            .await
            .unwrap();

        assert_eq!(report.status(), ExecutionStatus::Terminated);
        assert!(report.execution.started_at.is_none());
        assert!(calls_of(&calls).is_empty());
    }

    // --- preflight ---

    #[tokio::test]
    async fn validation_failure_faults_from_idle() {
        let (orch, _, calls) = orchestrator();
        let mut bad = task("bad", "ok");
        bad.parameters.insert("unexpected".to_string(), json!(1));
        let good = task("good", "ok");
        let def = definition(vec![stage("one", 0, false, vec![bad.clone(), good.clone()])]);
        let report = orch.execute(RunRequest::new(def, [template()])).await.unwrap();

        assert_eq!(report.status(), ExecutionStatus::Faulted);
        assert!(report.execution.started_at.is_none());
        assert_eq!(report.task_run(bad.id).unwrap().status, ExpressionStatus::Dysregulated);
        assert_eq!(report.task_run(good.id).unwrap().status, ExpressionStatus::Quiescent);
        assert!(report.messages.iter().any(|m| m.contains("unknown parameter")));
        assert!(calls_of(&calls).is_empty());
    }

    #[tokio::test]
    async fn tenant_mismatch_faults() {
        let (orch, _, _) = orchestrator();
        let def = definition(vec![stage("one", 0, false, vec![task("a", "ok")])]);
        let report = orch
            .execute(RunRequest::new(def, [template()]).with_tenant(Uuid::from_u128(0xbad)))
            .await
            .unwrap();
        assert_eq!(report.status(), ExecutionStatus::Faulted);
        assert!(report.messages.iter().any(|m| m.contains("does not match workflow tenant")));
    }

    #[tokio::test]
    async fn false_workflow_condition_skips() {
        let (orch, _, calls) = orchestrator();
        let mut def = definition(vec![stage("one", 0, false, vec![task("a", "ok")])]);
        def.condition = Some("input.enabled".to_string());
        let report = orch
            .execute(RunRequest::new(def, [template()]).with_input(json!({"enabled": false})))
            .await
            .unwrap();

        assert_eq!(report.status(), ExecutionStatus::Skipped);
        assert!(report
            .execution
            .task_runs
            .iter()
            .all(|r| r.status == ExpressionStatus::Skipped));
        assert!(calls_of(&calls).is_empty());
    }

    // --- collaborators ---

    #[tokio::test]
    async fn collaborator_failures_become_warnings() {
        let (orch, _) = orchestrator_with(
            Arc::new(BrokenStore),
            Arc::new(BrokenPublisher),
            EngineConfig::default(),
        );
        let def = definition(vec![stage("one", 0, false, vec![task("a", "ok")])]);
        let report = orch.execute(RunRequest::new(def, [template()])).await.unwrap();

        assert_eq!(report.status(), ExecutionStatus::Completed);
        assert!(report.is_degraded());
        assert!(report.warnings.iter().any(|w| w.operation == "save_task_run"));
        assert!(report.warnings.iter().any(|w| w.operation == "save_workflow_execution"));
        assert!(report
            .warnings
            .iter()
            .any(|w| w.operation == "publish:workflow_execution_transitioned"));
    }

    #[tokio::test]
    async fn events_are_published_on_the_bus() {
        let bus = Arc::new(EventBus::new(256));
        let mut rx = bus.subscribe();
        let (orch, _) = orchestrator_with(
            Arc::new(RecordingStore::default()),
            bus.clone(),
            EngineConfig::default(),
        );
        let def = definition(vec![stage("one", 0, false, vec![task("a", "ok")])]);
        orch.execute(RunRequest::new(def, [template()])).await.unwrap();

        let mut kinds = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            kinds.push(envelope.kind);
        }
        assert_eq!(
            kinds,
            vec![
                "workflow_execution_transitioned",
                "task_run_transitioned",
                "task_run_transitioned",
                "stage_completed",
                "workflow_execution_transitioned",
            ]
        );
    }

    // --- admission ---

    #[tokio::test]
    async fn concurrency_limit_rejects_excess_executions() {
        let (orch, _) = orchestrator_with(
            Arc::new(RecordingStore::default()),
            Arc::new(EventBus::new(16)),
            EngineConfig {
                max_concurrent_executions: Some(1),
                ..EngineConfig::default()
            },
        );
        let orch = Arc::new(orch);
        let def = definition(vec![stage("one", 0, false, vec![task("a", "hang")])]);
        let first = RunRequest::new(def.clone(), [template()]);
        let first_id = first.execution_id;

        let runner = Arc::clone(&orch);
        let handle = tokio::spawn(async move { runner.execute(first).await });
        tokio::time::sleep(Duration::from_millis(30)).await;

        let second = orch.execute(RunRequest::new(def, [template()])).await;
        assert!(matches!(
            second,
            Err(EngineError::ConcurrencyLimitReached { limit: 1 })
        ));

        orch.cancel(first_id);
        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.status(), ExecutionStatus::Terminated);
    }

    #[tokio::test]
    async fn duplicate_execution_id_is_rejected() {
        let (orch, store, _) = orchestrator();
        let orch = Arc::new(orch);
        let def = definition(vec![stage("one", 0, false, vec![task("a", "hang")])]);
        let first = RunRequest::new(def, [template()]);
        let execution_id = first.execution_id;
        let second = first.clone();

        let runner = Arc::clone(&orch);
        let handle = tokio::spawn(async move { runner.execute(first).await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        let saved_before = store.executions.lock().await.len();

        let rejected = orch.execute(second).await;
        assert!(matches!(
            rejected,
            Err(EngineError::DuplicateExecution { execution_id: id }) if id == execution_id
        ));
        assert_eq!(store.executions.lock().await.len(), saved_before);
        assert_eq!(orch.active_executions(), vec![execution_id]);

        assert!(orch.cancel(execution_id));
        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.status(), ExecutionStatus::Terminated);
        assert!(orch.active_executions().is_empty());
    }

    #[tokio::test]
    async fn dropped_run_releases_its_registration() {
        let (orch, _, _) = orchestrator();
        let def = definition(vec![stage("one", 0, false, vec![task("a", "hang")])]);
        let request = RunRequest::new(def, [template()]);
        let execution_id = request.execution_id;

        let abandoned = tokio::time::timeout(Duration::from_millis(30), orch.execute(request)).await;
        assert!(abandoned.is_err());
        assert!(orch.active_executions().is_empty());
        assert!(!orch.cancel(execution_id));
    }
}
