use thiserror::Error;

/// Errors from execution record store operations (used by trait definitions in helix-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("store connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

/// Errors from event publisher operations.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("no subscribers for event '{0}'")]
    NoSubscribers(String),

    #[error("publisher unavailable: {0}")]
    Unavailable(String),

    #[error("event serialization failed: {0}")]
    Serialization(String),
}

/// An illegal lifecycle transition was requested.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal {entity} transition: {from} -> {to}")]
pub struct TransitionError {
    /// Which lifecycle the transition belongs to ("execution" or "task run").
    pub entity: &'static str,
    pub from: String,
    pub to: String,
}
