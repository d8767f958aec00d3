//! In-memory queue for tests and single-process deployments.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::MessageId;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::{AckToken, MessagingError, QueueClient, QueueDepth, QueueEnvelope, Result};

struct Lease {
    token: AckToken,
    until: Instant,
}

struct StoredMessage {
    seq: u64,
    payload: Vec<u8>,
    enqueued_at: DateTime<Utc>,
    delivery_count: u32,
    lease: Option<Lease>,
}

#[derive(Default)]
struct QueueState {
    next_seq: u64,
    ready: VecDeque<MessageId>,
    messages: HashMap<MessageId, StoredMessage>,
}

impl QueueState {
    /// Returns messages whose lease expired to the front of the ready list,
    /// oldest first.
    fn reclaim_expired(&mut self, now: Instant) {
        let mut expired: Vec<(u64, MessageId)> = self
            .messages
            .iter_mut()
            .filter(|(_, message)| message.lease.as_ref().is_some_and(|l| l.until <= now))
            .map(|(id, message)| {
                message.lease = None;
                (message.seq, *id)
            })
            .collect();

        expired.sort_unstable_by(|a, b| b.0.cmp(&a.0));
        for (_, id) in expired {
            tracing::debug!(message_id = %id, "visibility expired, message requeued");
            self.ready.push_front(id);
        }
    }

    fn leased_mut(&mut self, envelope: &QueueEnvelope) -> Option<&mut StoredMessage> {
        self.messages
            .get_mut(&envelope.message_id)
            .filter(|message| {
                message
                    .lease
                    .as_ref()
                    .is_some_and(|lease| lease.token == envelope.ack_token)
            })
    }
}

/// In-memory [`QueueClient`].
///
/// Clones share the same queues. Visibility deadlines use the tokio clock,
/// so tests can drive expiry with `tokio::time::pause`/`advance`.
#[derive(Clone, Default)]
pub struct InMemoryQueue {
    queues: Arc<Mutex<HashMap<String, QueueState>>>,
    fail_pushes: Arc<AtomicU32>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` pushes fail with a transport error.
    pub fn fail_next_pushes(&self, n: u32) {
        self.fail_pushes.store(n, Ordering::SeqCst);
    }

    /// Returns true if the message is in the queue, ready or in flight.
    pub async fn contains(&self, queue: &str, message_id: MessageId) -> bool {
        self.queues
            .lock()
            .await
            .get(queue)
            .is_some_and(|state| state.messages.contains_key(&message_id))
    }

    /// Returns the payloads of the ready messages, in delivery order.
    pub async fn ready_payloads(&self, queue: &str) -> Vec<Vec<u8>> {
        let queues = self.queues.lock().await;
        let Some(state) = queues.get(queue) else {
            return Vec::new();
        };
        state
            .ready
            .iter()
            .filter_map(|id| state.messages.get(id))
            .map(|message| message.payload.clone())
            .collect()
    }

    /// Total number of messages (ready and in flight) in a queue.
    pub async fn len(&self, queue: &str) -> usize {
        self.queues
            .lock()
            .await
            .get(queue)
            .map_or(0, |state| state.messages.len())
    }
}

#[async_trait]
impl QueueClient for InMemoryQueue {
    async fn push(&self, queue: &str, message_id: MessageId, payload: &[u8]) -> Result<()> {
        if self
            .fail_pushes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(MessagingError::Transport(format!(
                "injected push failure on '{queue}'"
            )));
        }

        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue.to_string()).or_default();

        if state.messages.contains_key(&message_id) {
            tracing::debug!(queue, message_id = %message_id, "duplicate push ignored");
            return Ok(());
        }

        state.next_seq += 1;
        let seq = state.next_seq;
        state.messages.insert(
            message_id,
            StoredMessage {
                seq,
                payload: payload.to_vec(),
                enqueued_at: Utc::now(),
                delivery_count: 0,
                lease: None,
            },
        );
        state.ready.push_back(message_id);
        Ok(())
    }

    async fn pop(&self, queue: &str, visibility: Duration) -> Result<Option<QueueEnvelope>> {
        let mut queues = self.queues.lock().await;
        let Some(state) = queues.get_mut(queue) else {
            return Ok(None);
        };

        let now = Instant::now();
        state.reclaim_expired(now);

        while let Some(id) = state.ready.pop_front() {
            // Ids of messages acked while queued are skipped.
            let Some(message) = state.messages.get_mut(&id) else {
                continue;
            };
            if message.lease.is_some() {
                continue;
            }

            let token = AckToken::generate();
            message.delivery_count += 1;
            message.lease = Some(Lease {
                token: token.clone(),
                until: now + visibility,
            });

            return Ok(Some(QueueEnvelope {
                message_id: id,
                queue: queue.to_string(),
                payload: message.payload.clone(),
                enqueued_at: message.enqueued_at,
                delivery_count: message.delivery_count,
                ack_token: token,
            }));
        }

        Ok(None)
    }

    async fn ack(&self, envelope: &QueueEnvelope) -> Result<()> {
        let mut queues = self.queues.lock().await;
        let Some(state) = queues.get_mut(&envelope.queue) else {
            return Ok(());
        };
        let Some(message) = state.messages.get(&envelope.message_id) else {
            return Ok(());
        };

        let owns_lease = message
            .lease
            .as_ref()
            .is_some_and(|lease| lease.token == envelope.ack_token);
        if !owns_lease {
            return Err(MessagingError::StaleAckToken(envelope.message_id));
        }

        state.messages.remove(&envelope.message_id);
        Ok(())
    }

    async fn nack(&self, envelope: &QueueEnvelope) -> Result<()> {
        let mut queues = self.queues.lock().await;
        let state = queues
            .get_mut(&envelope.queue)
            .ok_or(MessagingError::NotInFlight(envelope.message_id))?;

        let message = state
            .leased_mut(envelope)
            .ok_or(MessagingError::NotInFlight(envelope.message_id))?;
        message.lease = None;
        state.ready.push_front(envelope.message_id);
        Ok(())
    }

    async fn extend_visibility(&self, envelope: &QueueEnvelope, visibility: Duration) -> Result<()> {
        let mut queues = self.queues.lock().await;
        let state = queues
            .get_mut(&envelope.queue)
            .ok_or(MessagingError::NotInFlight(envelope.message_id))?;

        let message = state
            .leased_mut(envelope)
            .ok_or(MessagingError::NotInFlight(envelope.message_id))?;
        if let Some(lease) = message.lease.as_mut() {
            lease.until = Instant::now() + visibility;
        }
        Ok(())
    }

    async fn depth(&self, queue: &str) -> Result<QueueDepth> {
        let queues = self.queues.lock().await;
        let Some(state) = queues.get(queue) else {
            return Ok(QueueDepth::default());
        };

        let in_flight = state
            .messages
            .values()
            .filter(|message| message.lease.is_some())
            .count() as u64;
        Ok(QueueDepth {
            ready: state.messages.len() as u64 - in_flight,
            in_flight,
        })
    }
}
