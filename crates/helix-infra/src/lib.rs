//! Infrastructure layer for Helix.
//!
//! Contains implementations of the collaborator traits defined in
//! `helix-core` (an in-memory execution record store and a tracing event
//! publisher), the config and bundle file loaders, and the built-in task
//! executors.

pub mod bundle;
pub mod config;
pub mod executors;
pub mod publisher;
pub mod store;
