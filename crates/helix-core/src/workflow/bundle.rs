//! Workflow bundle parsing.
//!
//! A bundle is a `{ definition, templates }` document in YAML or JSON. Parsing
//! only checks shape; structural rules are the validator's job at run time.

use std::path::Path;

use helix_types::workflow::WorkflowBundle;
use thiserror::Error;

/// Errors that can occur while reading a bundle.
#[derive(Debug, Error)]
pub enum BundleError {
    #[error("invalid YAML bundle: {0}")]
    Yaml(String),

    #[error("invalid JSON bundle: {0}")]
    Json(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// File extension is not `.yaml`, `.yml` or `.json`.
    #[error("unsupported bundle format: {0}")]
    UnsupportedFormat(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleFormat {
    Yaml,
    Json,
}

impl BundleFormat {
    /// Pick the format from a file extension.
    pub fn from_path(path: &Path) -> Result<Self, BundleError> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml" | "yml") => Ok(Self::Yaml),
            Some("json") => Ok(Self::Json),
            Some(other) => Err(BundleError::UnsupportedFormat(other.to_string())),
            None => Err(BundleError::UnsupportedFormat(path.display().to_string())),
        }
    }
}

pub fn parse_bundle_yaml(yaml: &str) -> Result<WorkflowBundle, BundleError> {
    serde_yaml_ng::from_str(yaml).map_err(|e| BundleError::Yaml(e.to_string()))
}

pub fn parse_bundle_json(json: &str) -> Result<WorkflowBundle, BundleError> {
    serde_json::from_str(json).map_err(|e| BundleError::Json(e.to_string()))
}

pub fn parse_bundle(content: &str, format: BundleFormat) -> Result<WorkflowBundle, BundleError> {
    match format {
        BundleFormat::Yaml => parse_bundle_yaml(content),
        BundleFormat::Json => parse_bundle_json(content),
    }
}

/// Serialize a bundle to YAML.
pub fn serialize_bundle_yaml(bundle: &WorkflowBundle) -> Result<String, BundleError> {
    serde_yaml_ng::to_string(bundle).map_err(|e| BundleError::Yaml(e.to_string()))
}
