//! Workflow engine core: validation, task expression, and orchestration.
//!
//! - `validator` -- structural and parameter validation of definitions
//! - `plan` -- stage ordering and intra-workflow dependency checks
//! - `condition` -- JEXL gates for workflows and tasks
//! - `backoff` -- jittered exponential retry delays
//! - `executor` / `box_executor` / `registry` -- pluggable task executors by kind
//! - `expression` -- drives one task through its lifecycle with retries
//! - `orchestrator` -- drives a workflow execution through its stages
//! - `journal` -- best-effort persistence and event publication per run
//! - `middleware` -- instrumentation and error translation around the orchestrator
//! - `bundle` -- YAML/JSON workflow bundle parsing

pub mod backoff;
pub mod box_executor;
pub mod bundle;
pub mod condition;
pub mod context;
pub mod executor;
pub mod expression;
pub mod journal;
pub mod middleware;
pub mod orchestrator;
pub mod plan;
pub mod registry;
pub mod validator;

pub use executor::{ExecutorFailure, TaskExecutor, TaskInvocation};
pub use middleware::{WorkflowRunner, compose};
pub use orchestrator::{EngineError, Orchestrator, RunReport, RunRequest};
pub use registry::ExecutorRegistry;
