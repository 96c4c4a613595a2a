//! Event publisher that writes every envelope to the tracing log.

use helix_core::event::EventPublisher;
use helix_types::error::PublishError;
use helix_types::event::EventEnvelope;

/// Logs each domain event at `info` under the `helix::events` target, with
/// the payload as JSON.
#[derive(Debug, Clone, Default)]
pub struct TracingEventPublisher;

impl TracingEventPublisher {
    pub fn new() -> Self {
        Self
    }
}

impl EventPublisher for TracingEventPublisher {
    async fn publish(&self, envelope: EventEnvelope) -> Result<(), PublishError> {
        let payload = serde_json::to_string(&envelope.payload)
            .map_err(|e| PublishError::Serialization(e.to_string()))?;
        tracing::info!(
            target: "helix::events",
            event_id = %envelope.id,
            kind = envelope.kind.as_str(),
            execution_id = %envelope.payload.execution_id(),
            occurred_on = %envelope.occurred_on,
            payload = payload.as_str(),
            "domain event"
        );
        Ok(())
    }
}
