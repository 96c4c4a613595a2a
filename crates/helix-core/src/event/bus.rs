//! Broadcast event bus for distributing `EventEnvelope`s to multiple subscribers.
//!
//! Built on `tokio::sync::broadcast`, the `EventBus` supports multiple
//! concurrent subscribers. Publishing with no active subscribers is a no-op.

use helix_types::config::EngineConfig;
use helix_types::error::PublishError;
use helix_types::event::EventEnvelope;
use tokio::sync::broadcast;

use super::publisher::EventPublisher;

/// Multi-consumer event bus for workflow lifecycle events.
///
/// Wraps a `tokio::sync::broadcast` channel. Cloning the bus clones the
/// sender, allowing multiple producers and consumers.
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    /// Create a new event bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Create a bus sized by `event_bus_capacity`.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.event_bus_capacity)
    }

    /// Create a new subscriber that will receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    /// Send an envelope to all current subscribers.
    ///
    /// If there are no subscribers, the envelope is silently dropped.
    pub fn send(&self, envelope: EventEnvelope) {
        let _ = self.sender.send(envelope);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl EventPublisher for EventBus {
    async fn publish(&self, envelope: EventEnvelope) -> Result<(), PublishError> {
        self.send(envelope);
        Ok(())
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}
