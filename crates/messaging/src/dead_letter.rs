//! Terminal destinations for messages that cannot be delivered.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::MessageId;
use tokio::sync::Mutex;

use crate::{QueueClient, QueueEnvelope, Result};

/// A message removed from the live queue, with the reason.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub envelope: QueueEnvelope,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(envelope: QueueEnvelope, reason: impl Into<String>) -> Self {
        Self {
            envelope,
            reason: reason.into(),
            dead_lettered_at: Utc::now(),
        }
    }

    pub fn message_id(&self) -> MessageId {
        self.envelope.message_id
    }
}

/// Where the consumer puts messages it gives up on.
///
/// Sinks must tolerate receiving the same message twice (the consumer may
/// crash between sending and acking) and keep only one copy.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn send(&self, letter: DeadLetter) -> Result<()>;
}

/// Keeps dead letters in memory.
#[derive(Clone, Default)]
pub struct InMemoryDeadLetterSink {
    letters: Arc<Mutex<Vec<DeadLetter>>>,
}

impl InMemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.letters.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.letters.lock().await.is_empty()
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterSink {
    async fn send(&self, letter: DeadLetter) -> Result<()> {
        let mut letters = self.letters.lock().await;
        if letters.iter().any(|l| l.message_id() == letter.message_id()) {
            return Ok(());
        }
        letters.push(letter);
        Ok(())
    }
}

/// Moves dead letters onto another queue, keeping id and payload.
///
/// Deduplication comes from the queue's push semantics.
pub struct QueueDeadLetterSink<Q> {
    queue: Q,
    name: String,
}

impl<Q: QueueClient> QueueDeadLetterSink<Q> {
    pub fn new(queue: Q, name: impl Into<String>) -> Self {
        Self {
            queue,
            name: name.into(),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl<Q: QueueClient> DeadLetterSink for QueueDeadLetterSink<Q> {
    async fn send(&self, letter: DeadLetter) -> Result<()> {
        tracing::warn!(
            message_id = %letter.message_id(),
            source_queue = %letter.envelope.queue,
            dead_letter_queue = %self.name,
            reason = %letter.reason,
            "message dead-lettered"
        );
        self.queue
            .push(&self.name, letter.envelope.message_id, &letter.envelope.payload)
            .await
    }
}
