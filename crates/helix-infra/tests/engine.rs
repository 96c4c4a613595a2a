//! End-to-end runs against the real in-memory adapters and built-in executors.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use helix_core::event::EventBus;
use helix_core::workflow::bundle::parse_bundle_yaml;
use helix_core::workflow::executor::{ExecutorFailure, TaskExecutor, TaskInvocation};
use helix_core::workflow::{Orchestrator, RunRequest, WorkflowRunner, compose};
use helix_infra::executors::builtin_registry;
use helix_infra::publisher::TracingEventPublisher;
use helix_infra::store::InMemoryExecutionStore;
use helix_types::config::EngineConfig;
use helix_types::execution::{ExecutionStatus, ExpressionStatus, StageStatus};
use helix_types::workflow::{RetryPolicy, WorkflowBundle};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const BUNDLE: &str = r#"
definition:
  id: "01938e90-0000-7000-8000-000000000001"
  tenant_id: "01938e90-0000-7000-8000-0000000000aa"
  name: orders
  version: "1"
  stages:
    - id: "01938e90-0000-7000-8000-000000000010"
      name: prepare
      priority: 0
      tasks:
        - id: "01938e90-0000-7000-8000-000000000100"
          tenant_id: "01938e90-0000-7000-8000-0000000000aa"
          name: greet
          template_id: "01938e90-0000-7000-8000-000000001000"
          parameters:
            message: hello
    - id: "01938e90-0000-7000-8000-000000000011"
      name: fan-out
      priority: 1
      run_in_parallel: true
      tasks:
        - id: "01938e90-0000-7000-8000-000000000101"
          tenant_id: "01938e90-0000-7000-8000-0000000000aa"
          name: wait-a
          template_id: "01938e90-0000-7000-8000-000000001001"
          parameters:
            duration_ms: 5
        - id: "01938e90-0000-7000-8000-000000000102"
          tenant_id: "01938e90-0000-7000-8000-0000000000aa"
          name: wait-b
          template_id: "01938e90-0000-7000-8000-000000001001"
          condition: "tasks.greet.message == 'hello'"
          parameters:
            duration_ms: 5
templates:
  - id: "01938e90-0000-7000-8000-000000001000"
    tenant_id: "01938e90-0000-7000-8000-0000000000aa"
    name: echo
    kind: echo
    parameters:
      - name: message
        type: string
        required: true
  - id: "01938e90-0000-7000-8000-000000001001"
    tenant_id: "01938e90-0000-7000-8000-0000000000aa"
    name: sleep
    kind: sleep
    parameters:
      - name: duration_ms
        type: integer
        required: true
"#;

fn bundle() -> WorkflowBundle {
    parse_bundle_yaml(BUNDLE).unwrap()
}

fn config() -> EngineConfig {
    EngineConfig {
        cancellation_grace_ms: 20,
        ..EngineConfig::default()
    }
}

/// Fails retryably until `succeed_on` is reached.
struct Flaky {
    calls: Arc<AtomicU32>,
    succeed_on: u32,
}

impl TaskExecutor for Flaky {
    fn kind(&self) -> &str {
        "flaky"
    }

    async fn execute(
        &self,
        invocation: TaskInvocation,
        _cancel: CancellationToken,
    ) -> Result<Value, ExecutorFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if invocation.attempt < self.succeed_on {
            Err(ExecutorFailure::retryable("upstream unavailable"))
        } else {
            Ok(json!({ "attempt": invocation.attempt }))
        }
    }
}

// --- full runs ---

#[tokio::test]
async fn bundle_runs_to_completion_and_is_persisted() {
    let store = Arc::new(InMemoryExecutionStore::new());
    let orchestrator = Orchestrator::new(
        store.clone(),
        Arc::new(TracingEventPublisher::new()),
        builtin_registry(),
        config(),
    );

    let report = compose(orchestrator)
        .run(RunRequest::from_bundle(bundle()))
        .await
        .unwrap();

    assert_eq!(report.status(), ExecutionStatus::Completed);
    assert!(report.stages.iter().all(|s| s.status == StageStatus::Completed));
    assert!(report.warnings.is_empty());

    let greet = Uuid::parse_str("01938e90-0000-7000-8000-000000000100").unwrap();
    let greet_run = report.task_run(greet).unwrap();
    assert_eq!(greet_run.status, ExpressionStatus::Expressed);
    assert_eq!(
        greet_run.result.as_ref().and_then(|r| r.output.clone()),
        Some(json!({"message": "hello"}))
    );

    let stored = store.get_execution(report.execution.id).unwrap();
    assert_eq!(stored.status, ExecutionStatus::Completed);
    assert!(stored.completed_at.is_some());

    let runs = store.runs_for_execution(report.execution.id);
    assert_eq!(runs.len(), 3);
    assert!(runs.iter().all(|r| r.status == ExpressionStatus::Expressed));
}

#[tokio::test]
async fn retries_are_recorded_as_separate_runs() {
    let mut bundle = bundle();
    bundle.templates[0].kind = "flaky".to_string();
    bundle.definition.stages[0].tasks[0].retry = Some(RetryPolicy {
        max_attempts: 3,
        initial_delay_ms: 1,
        backoff_coefficient: 0.0,
    });

    let calls = Arc::new(AtomicU32::new(0));
    let mut registry = builtin_registry();
    registry.register(Flaky {
        calls: calls.clone(),
        succeed_on: 3,
    });

    let store = Arc::new(InMemoryExecutionStore::new());
    let bus = Arc::new(EventBus::new(256));
    let mut events = bus.subscribe();
    let orchestrator = Orchestrator::new(store.clone(), bus, registry, config());

    let request = RunRequest::from_bundle(bundle);
    let execution_id = request.execution_id;
    let report = orchestrator.run(request).await.unwrap();

    assert_eq!(report.status(), ExecutionStatus::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let greet = Uuid::parse_str("01938e90-0000-7000-8000-000000000100").unwrap();
    let runs = store.runs_for_task(execution_id, greet);
    let summary: Vec<(u32, ExpressionStatus, bool)> = runs
        .iter()
        .map(|r| (r.attempt, r.status, r.retry_scheduled))
        .collect();
    assert_eq!(
        summary,
        vec![
            (1, ExpressionStatus::Dysregulated, true),
            (2, ExpressionStatus::Dysregulated, true),
            (3, ExpressionStatus::Expressed, false),
        ]
    );

    let mut retries = 0;
    while let Ok(envelope) = events.try_recv() {
        if envelope.kind == "task_retry_scheduled" {
            retries += 1;
        }
    }
    assert_eq!(retries, 2);
}

#[tokio::test]
async fn cancellation_from_outside_terminates_run() {
    let mut bundle = bundle();
    for task in &mut bundle.definition.stages[1].tasks {
        task.parameters.insert("duration_ms".to_string(), json!(60_000));
    }

    let store = Arc::new(InMemoryExecutionStore::new());
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        Arc::new(TracingEventPublisher::new()),
        builtin_registry(),
        config(),
    ));

    let token = CancellationToken::new();
    let request = RunRequest::from_bundle(bundle).with_cancellation(token.clone());
    let execution_id = request.execution_id;
    let runner = compose(Arc::clone(&orchestrator));
    let handle = tokio::spawn(async move { runner.run(request).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    token.cancel();

    let report = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(report.status(), ExecutionStatus::Terminated);
    assert_eq!(report.stages[0].status, StageStatus::Completed);
    assert_eq!(report.stages[1].status, StageStatus::Terminated);

    let stored = store.get_execution(execution_id).unwrap();
    assert_eq!(stored.status, ExecutionStatus::Terminated);
    assert!(orchestrator.active_executions().is_empty());
}

#[tokio::test]
async fn invalid_bundle_faults_without_running_anything() {
    let mut bundle = bundle();
    bundle.definition.stages[0].tasks[0].parameters.remove("message");

    let store = Arc::new(InMemoryExecutionStore::new());
    let orchestrator = Orchestrator::new(
        store.clone(),
        Arc::new(TracingEventPublisher::new()),
        builtin_registry(),
        config(),
    );
    let report = compose(orchestrator)
        .run(RunRequest::from_bundle(bundle))
        .await
        .unwrap();

    assert_eq!(report.status(), ExecutionStatus::Faulted);
    assert!(report.messages.iter().any(|m| m.contains("missing required parameter 'message'")));
    let runs = store.runs_for_execution(report.execution.id);
    assert!(runs.iter().all(|r| r.started_at.is_none()));
}

#[tokio::test]
async fn concurrency_limit_is_translated_into_faulted_report() {
    let mut slow = bundle();
    for task in &mut slow.definition.stages[1].tasks {
        task.parameters.insert("duration_ms".to_string(), json!(60_000));
    }

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::new(InMemoryExecutionStore::new()),
        Arc::new(TracingEventPublisher::new()),
        builtin_registry(),
        EngineConfig {
            max_concurrent_executions: Some(1),
            ..config()
        },
    ));
    let runner = Arc::new(compose(Arc::clone(&orchestrator)));

    let first = RunRequest::from_bundle(slow);
    let first_id = first.execution_id;
    let background = Arc::clone(&runner);
    let handle = tokio::spawn(async move { background.run(first).await });
    tokio::time::sleep(Duration::from_millis(30)).await;

    let rejected = runner.run(RunRequest::from_bundle(bundle())).await.unwrap();
    assert_eq!(rejected.status(), ExecutionStatus::Faulted);
    assert!(rejected.messages[0].contains("concurrency limit reached"));

    assert!(orchestrator.cancel(first_id));
    let report = handle.await.unwrap().unwrap();
    assert_eq!(report.status(), ExecutionStatus::Terminated);
}
