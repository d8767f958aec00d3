//! Durable queue abstraction with visibility timeouts.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::MessageId;

use crate::Result;

/// Opaque lease token handed out by `pop`.
///
/// Only the holder of the current token may ack, nack or extend the
/// message. A new token is issued on every delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AckToken(String);

impl AckToken {
    pub(crate) fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AckToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message as received from the queue.
#[derive(Debug, Clone)]
pub struct QueueEnvelope {
    pub message_id: MessageId,

    /// Queue the message was received from.
    pub queue: String,

    pub payload: Vec<u8>,

    /// When the message was first pushed.
    pub enqueued_at: DateTime<Utc>,

    /// Number of times the message has been received, this delivery
    /// included. Starts at 1.
    pub delivery_count: u32,

    pub ack_token: AckToken,
}

/// Message counts of one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepth {
    /// Messages waiting to be received.
    pub ready: u64,
    /// Messages received and not yet acked, nacked or expired.
    pub in_flight: u64,
}

/// Client of a durable queue with at-least-once semantics.
///
/// A popped message stays in the queue, hidden from other consumers, until
/// it is acked, nacked or its visibility timeout expires. Implementations
/// must be safe to share between concurrent producers and consumers.
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Durably enqueues a payload under `message_id`.
    ///
    /// Pushing an id that is still in the queue (ready or in flight) is a
    /// no-op.
    async fn push(&self, queue: &str, message_id: MessageId, payload: &[u8]) -> Result<()>;

    /// Receives the next available message and hides it for `visibility`.
    ///
    /// Returns `None` immediately when nothing is available.
    async fn pop(&self, queue: &str, visibility: Duration) -> Result<Option<QueueEnvelope>>;

    /// Removes a message for good.
    ///
    /// Acking a message that is already gone is a no-op. Acking with a token
    /// that lost its lease fails with
    /// [`StaleAckToken`](crate::MessagingError::StaleAckToken).
    async fn ack(&self, envelope: &QueueEnvelope) -> Result<()>;

    /// Makes a message visible again right away.
    ///
    /// Its next delivery reports a delivery count one higher.
    async fn nack(&self, envelope: &QueueEnvelope) -> Result<()>;

    /// Pushes the visibility deadline of an in-flight message to
    /// `visibility` from now.
    async fn extend_visibility(&self, envelope: &QueueEnvelope, visibility: Duration) -> Result<()>;

    /// Returns the message counts of a queue.
    async fn depth(&self, queue: &str) -> Result<QueueDepth>;
}

#[async_trait]
impl<T: QueueClient + ?Sized> QueueClient for Arc<T> {
    async fn push(&self, queue: &str, message_id: MessageId, payload: &[u8]) -> Result<()> {
        (**self).push(queue, message_id, payload).await
    }

    async fn pop(&self, queue: &str, visibility: Duration) -> Result<Option<QueueEnvelope>> {
        (**self).pop(queue, visibility).await
    }

    async fn ack(&self, envelope: &QueueEnvelope) -> Result<()> {
        (**self).ack(envelope).await
    }

    async fn nack(&self, envelope: &QueueEnvelope) -> Result<()> {
        (**self).nack(envelope).await
    }

    async fn extend_visibility(&self, envelope: &QueueEnvelope, visibility: Duration) -> Result<()> {
        (**self).extend_visibility(envelope, visibility).await
    }

    async fn depth(&self, queue: &str) -> Result<QueueDepth> {
        (**self).depth(queue).await
    }
}
