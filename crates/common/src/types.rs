use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Namespace used to derive integration message ids from event identities.
const MESSAGE_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2b8e_4d0a_4e55_9a3b_7c2e_51d8_0f44);

/// Unique identifier for a raised domain event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Creates a new random event ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an event ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EventId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Identifier of an integration message on the external queue.
///
/// Message ids are derived, not random: the same event type and identity
/// always yield the same id, so a re-published event can be recognised by
/// consumers as a duplicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Derives the message id for an event type and identity.
    pub fn derive(event_type: &str, identity: &str) -> Self {
        let name = format!("{event_type}:{identity}");
        Self(Uuid::new_v5(&MESSAGE_NAMESPACE, name.as_bytes()))
    }

    /// Creates a message ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for MessageId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Opaque actor/subject identifier carried for audit purposes.
///
/// Authentication happens elsewhere; this is only the resolved subject.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(String);

impl ActorId {
    pub fn new(subject: impl Into<String>) -> Self {
        Self(subject.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ActorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_id_new_creates_unique_ids() {
        let id1 = EventId::new();
        let id2 = EventId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn message_id_is_stable_for_same_identity() {
        let first = MessageId::derive("BookingCreated", "b1");
        let second = MessageId::derive("BookingCreated", "b1");
        assert_eq!(first, second);
    }

    #[test]
    fn message_id_differs_per_event_type() {
        let created = MessageId::derive("BookingCreated", "b1");
        let cancelled = MessageId::derive("BookingCancelled", "b1");
        assert_ne!(created, cancelled);
    }

    #[test]
    fn message_id_parses_its_display_form() {
        let id = MessageId::derive("BookingCreated", "b1");
        let parsed: MessageId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn actor_id_serializes_transparently() {
        let actor = ActorId::new("user-42");
        let json = serde_json::to_string(&actor).unwrap();
        assert_eq!(json, "\"user-42\"");
    }
}
