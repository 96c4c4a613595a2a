//! Helix workflow runner.
//!
//! Binary name: `helix`
//!
//! Usage: `helix <bundle.yaml|bundle.json>`
//!
//! Loads `helix.toml` from `HELIX_HOME` (or the current directory), runs the
//! bundle with the built-in executors, and prints the run report as JSON.
//! Ctrl-C cancels the execution. Exits non-zero unless the execution
//! completed or was skipped.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use helix_core::workflow::{Orchestrator, RunRequest, WorkflowRunner, compose};
use helix_infra::bundle::load_bundle;
use helix_infra::config::{load_engine_config, resolve_home};
use helix_infra::executors::builtin_registry;
use helix_infra::publisher::TracingEventPublisher;
use helix_infra::store::InMemoryExecutionStore;
use helix_observe::{TracingOptions, init_tracing, shutdown_tracing};
use helix_types::execution::ExecutionStatus;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing(TracingOptions::from_env())
        .map_err(|e| anyhow::anyhow!("failed to initialise tracing: {e}"))?;

    let result = run().await;
    shutdown_tracing();

    let status = result?;
    if !matches!(status, ExecutionStatus::Completed | ExecutionStatus::Skipped) {
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> anyhow::Result<ExecutionStatus> {
    let Some(bundle_path) = std::env::args_os().nth(1).map(PathBuf::from) else {
        bail!("usage: helix <bundle.yaml|bundle.json>");
    };

    let cwd = std::env::current_dir().context("failed to read current directory")?;
    let home = resolve_home(cwd);
    let config = load_engine_config(&home).await;
    tracing::debug!(home = %home.display(), ?config, "engine configuration loaded");

    let bundle = load_bundle(&bundle_path)
        .await
        .with_context(|| format!("failed to load bundle {}", bundle_path.display()))?;

    let orchestrator = Orchestrator::new(
        Arc::new(InMemoryExecutionStore::new()),
        Arc::new(TracingEventPublisher::new()),
        builtin_registry(),
        config,
    );
    let runner = compose(orchestrator);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling execution");
            on_signal.cancel();
        }
    });

    let request = RunRequest::from_bundle(bundle).with_cancellation(cancel);
    let report = runner.run(request).await?;

    let json = serde_json::to_string_pretty(&report).context("failed to serialize run report")?;
    println!("{json}");

    Ok(report.status())
}
