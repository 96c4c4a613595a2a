//! Domain event publishing.
//!
//! `EventPublisher` is the port the engine publishes lifecycle events
//! through. `EventBus` is the in-process implementation that distributes
//! envelopes to subscribers via a `tokio::sync::broadcast` channel.

pub mod bus;
pub mod publisher;

pub use bus::EventBus;
pub use publisher::EventPublisher;
