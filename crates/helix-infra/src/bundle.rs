//! Workflow bundle file loading.

use std::path::{Path, PathBuf};

use helix_core::workflow::bundle::{BundleError, BundleFormat, parse_bundle};
use helix_types::workflow::WorkflowBundle;

/// Load a bundle from a `.yaml`, `.yml` or `.json` file.
pub async fn load_bundle(path: &Path) -> Result<WorkflowBundle, BundleError> {
    let format = BundleFormat::from_path(path)?;
    let content = tokio::fs::read_to_string(path).await?;
    let bundle = parse_bundle(&content, format)?;
    tracing::debug!(
        path = %path.display(),
        workflow = bundle.definition.name.as_str(),
        templates = bundle.templates.len(),
        "loaded workflow bundle"
    );
    Ok(bundle)
}

/// Load every bundle directly under `dir`. Files that fail to load are
/// skipped with a warning.
pub async fn discover_bundles(dir: &Path) -> Result<Vec<(PathBuf, WorkflowBundle)>, BundleError> {
    let mut results = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(results),
        Err(err) => return Err(err.into()),
    };

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if BundleFormat::from_path(&path).is_err() {
            continue;
        }
        match load_bundle(&path).await {
            Ok(bundle) => results.push((path, bundle)),
            Err(err) => tracing::warn!(path = %path.display(), error = %err, "skipping unloadable bundle"),
        }
    }
    results.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(results)
}
