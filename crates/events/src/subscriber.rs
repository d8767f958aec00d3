//! Subscriber trait for event reactions.

use std::sync::Arc;

use async_trait::async_trait;

use crate::{BoxError, EventEnvelope};

/// A reaction to events of one or more types.
///
/// Subscribers run on the dispatching task, one after another. A
/// subscriber that may be handed the same event twice (anything behind the
/// queue) must be idempotent with respect to [`EventEnvelope::message_id`].
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    /// Returns the name of this subscriber, used in logs and reports.
    fn name(&self) -> &str;

    /// Handles a single event.
    async fn on_event(&self, event: &EventEnvelope) -> Result<(), BoxError>;
}

#[async_trait]
impl<T: EventSubscriber + ?Sized> EventSubscriber for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn on_event(&self, event: &EventEnvelope) -> Result<(), BoxError> {
        (**self).on_event(event).await
    }
}
