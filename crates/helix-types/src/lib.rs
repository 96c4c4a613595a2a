//! Shared domain types for Helix.
//!
//! This crate contains the domain model used across the workflow engine:
//! workflow definitions, task templates, execution records, lifecycle
//! statuses, domain events, engine configuration, and collaborator errors.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod execution;
pub mod workflow;
