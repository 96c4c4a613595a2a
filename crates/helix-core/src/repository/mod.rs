//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (helix-infra) implements. The core crate never depends on any specific
//! storage technology.

pub mod execution;

pub use execution::ExecutionRecordStore;
