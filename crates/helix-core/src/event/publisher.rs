use helix_types::error::PublishError;
use helix_types::event::EventEnvelope;

/// Receiver of domain events.
///
/// Fire-and-forget from the engine's viewpoint: a failed publish is
/// reported as a collaborator warning and never changes an outcome.
pub trait EventPublisher: Send + Sync {
    fn publish(
        &self,
        envelope: EventEnvelope,
    ) -> impl std::future::Future<Output = Result<(), PublishError>> + Send;
}
