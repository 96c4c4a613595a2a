//! Workflow execution engine and collaborator trait definitions for Helix.
//!
//! This crate defines the "ports" (record store and event publisher traits)
//! that the infrastructure layer implements, and the engine that drives
//! workflow executions through them. It depends only on `helix-types` --
//! never on `helix-infra` or any storage crate.

pub mod event;
pub mod repository;
pub mod workflow;
