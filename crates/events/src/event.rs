use std::collections::HashMap;

use chrono::{DateTime, Utc};
use common::{ActorId, EventId, MessageId};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

/// Trait for domain events.
///
/// Domain events represent facts that have happened in the domain.
/// They are immutable and should be named in past tense.
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync {
    /// Returns the event type name.
    ///
    /// This is the routing key for subscribers and the queue.
    fn event_type(&self) -> &'static str;

    /// Returns the stable identity of the fact this event records.
    ///
    /// Two raises of the same fact (for example a retried command) should
    /// report the same identity so downstream consumers can deduplicate.
    /// `None` falls back to the randomly generated event id.
    fn identity(&self) -> Option<String> {
        None
    }
}

/// An event envelope containing an event along with its metadata.
///
/// Envelopes are what subscribers receive and what the broker serializes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique identifier for this event.
    pub event_id: EventId,

    /// The type of the event (e.g., "BookingCreated").
    pub event_type: String,

    /// Stable identity of the recorded fact.
    pub identity: String,

    /// Position of the event within its unit of work, starting at 1.
    pub sequence: u64,

    /// When the event was raised.
    pub timestamp: DateTime<Utc>,

    /// The actor on whose behalf the event was raised, if known.
    pub actor: Option<ActorId>,

    /// The event payload as JSON.
    pub payload: serde_json::Value,

    /// Additional metadata about the event.
    pub metadata: HashMap<String, serde_json::Value>,
}

impl EventEnvelope {
    /// Creates a new event envelope builder.
    pub fn builder() -> EventEnvelopeBuilder {
        EventEnvelopeBuilder::default()
    }

    /// Wraps a typed event.
    pub fn from_event<E: DomainEvent>(event: &E) -> Result<EventEnvelopeBuilder, serde_json::Error> {
        let builder = EventEnvelope::builder()
            .event_type(event.event_type())
            .payload(event)?;

        Ok(match event.identity() {
            Some(identity) => builder.identity(identity),
            None => builder,
        })
    }

    /// Decodes the payload back into a typed event.
    pub fn decode<E: DomainEvent>(&self) -> Result<E, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    /// Returns the integration message id for this event.
    ///
    /// Derived from the event type and identity, so it is identical for
    /// every redelivery of the same fact.
    pub fn message_id(&self) -> MessageId {
        MessageId::derive(&self.event_type, &self.identity)
    }
}

/// Builder for constructing event envelopes.
#[derive(Debug, Default)]
pub struct EventEnvelopeBuilder {
    event_id: Option<EventId>,
    event_type: Option<String>,
    identity: Option<String>,
    sequence: Option<u64>,
    timestamp: Option<DateTime<Utc>>,
    actor: Option<ActorId>,
    payload: Option<serde_json::Value>,
    metadata: HashMap<String, serde_json::Value>,
}

impl EventEnvelopeBuilder {
    /// Sets the event ID. If not set, a new ID will be generated.
    pub fn event_id(mut self, id: EventId) -> Self {
        self.event_id = Some(id);
        self
    }

    /// Sets the event type.
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    /// Sets the identity. If not set, the event id is used.
    pub fn identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    /// Sets the sequence. Defaults to 1.
    pub fn sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }

    /// Sets the timestamp. If not set, the current time will be used.
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Sets the actor.
    pub fn actor(mut self, actor: ActorId) -> Self {
        self.actor = Some(actor);
        self
    }

    /// Sets the payload from a serializable value.
    pub fn payload<T: Serialize>(mut self, payload: &T) -> Result<Self, serde_json::Error> {
        self.payload = Some(serde_json::to_value(payload)?);
        Ok(self)
    }

    /// Sets the payload from a raw JSON value.
    pub fn payload_raw(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Adds a metadata entry.
    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Builds the event envelope.
    ///
    /// # Panics
    ///
    /// Panics if `event_type` or `payload` is not set.
    pub fn build(self) -> EventEnvelope {
        self.try_build()
            .expect("event_type and payload are required")
    }

    /// Tries to build the event envelope, returning None if required fields are missing.
    pub fn try_build(self) -> Option<EventEnvelope> {
        let event_id = self.event_id.unwrap_or_default();
        Some(EventEnvelope {
            event_id,
            event_type: self.event_type?,
            identity: self.identity.unwrap_or_else(|| event_id.to_string()),
            sequence: self.sequence.unwrap_or(1),
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            actor: self.actor,
            payload: self.payload?,
            metadata: self.metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct BookingCreated {
        booking_id: String,
    }

    impl DomainEvent for BookingCreated {
        fn event_type(&self) -> &'static str {
            "BookingCreated"
        }

        fn identity(&self) -> Option<String> {
            Some(self.booking_id.clone())
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Pinged;

    impl DomainEvent for Pinged {
        fn event_type(&self) -> &'static str {
            "Pinged"
        }
    }

    #[test]
    fn event_envelope_builder() {
        let payload = serde_json::json!({"item": "test"});

        let envelope = EventEnvelope::builder()
            .event_type("TestEvent")
            .identity("t-1")
            .sequence(3)
            .actor(ActorId::new("user-1"))
            .payload_raw(payload.clone())
            .metadata("correlation_id", serde_json::json!("123"))
            .build();

        assert_eq!(envelope.event_type, "TestEvent");
        assert_eq!(envelope.identity, "t-1");
        assert_eq!(envelope.sequence, 3);
        assert_eq!(envelope.actor, Some(ActorId::new("user-1")));
        assert_eq!(envelope.payload, payload);
        assert_eq!(
            envelope.metadata.get("correlation_id"),
            Some(&serde_json::json!("123"))
        );
    }

    #[test]
    fn event_envelope_try_build_returns_none_on_missing_fields() {
        let result = EventEnvelope::builder().try_build();
        assert!(result.is_none());
    }

    #[test]
    fn from_event_uses_event_identity() {
        let event = BookingCreated {
            booking_id: "b1".to_string(),
        };
        let envelope = EventEnvelope::from_event(&event).unwrap().build();

        assert_eq!(envelope.event_type, "BookingCreated");
        assert_eq!(envelope.identity, "b1");
        assert_eq!(envelope.decode::<BookingCreated>().unwrap(), event);
    }

    #[test]
    fn identity_defaults_to_event_id() {
        let envelope = EventEnvelope::from_event(&Pinged).unwrap().build();
        assert_eq!(envelope.identity, envelope.event_id.to_string());
    }

    #[test]
    fn message_id_is_stable_across_raises_of_same_fact() {
        let event = BookingCreated {
            booking_id: "b1".to_string(),
        };
        let first = EventEnvelope::from_event(&event).unwrap().build();
        let second = EventEnvelope::from_event(&event).unwrap().build();

        assert_ne!(first.event_id, second.event_id);
        assert_eq!(first.message_id(), second.message_id());
        assert_eq!(
            first.message_id(),
            MessageId::derive("BookingCreated", "b1")
        );
    }
}
