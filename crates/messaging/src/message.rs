//! Integration messages: domain events serialized for the external queue.

use common::MessageId;
use events::EventEnvelope;
use serde::{Deserialize, Serialize};

use crate::{MessagingError, Result};

/// A domain event prepared for transport.
///
/// On the wire this is a JSON object with the payload bytes in base64:
///
/// ```json
/// {"message_id": "…", "message_type": "BookingCreated", "queue": "bookings", "payload": "eyJ…"}
/// ```
///
/// The payload is the JSON encoding of the source [`EventEnvelope`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrationMessage {
    /// Deterministic id of the underlying fact.
    pub message_id: MessageId,

    /// Type tag of the event.
    pub message_type: String,

    /// Destination queue name.
    pub queue: String,

    /// Serialized event envelope.
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
}

impl IntegrationMessage {
    /// Wraps a released event for the given queue.
    pub fn from_event(event: &EventEnvelope, queue: impl Into<String>) -> Result<Self> {
        Ok(Self {
            message_id: event.message_id(),
            message_type: event.event_type.clone(),
            queue: queue.into(),
            payload: serde_json::to_vec(event)?,
        })
    }

    /// Decodes the carried event envelope.
    pub fn to_event(&self) -> Result<EventEnvelope> {
        serde_json::from_slice(&self.payload).map_err(|error| MessagingError::Undecodable {
            message_id: self.message_id,
            reason: error.to_string(),
        })
    }

    /// Encodes the message into queue payload bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes a message from queue payload bytes.
    ///
    /// `message_id` is the id the queue stored the payload under; it is only
    /// used to report a failure.
    pub fn decode(message_id: MessageId, bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|error| MessagingError::Undecodable {
            message_id,
            reason: error.to_string(),
        })
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
