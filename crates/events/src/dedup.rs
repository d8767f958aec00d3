//! Message-id based deduplication for at-least-once subscribers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::{BoxError, EventEnvelope, EventSubscriber, MessageId};

const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_CAPACITY: usize = 100_000;

/// Wraps a subscriber so each message id is processed at most once.
///
/// An id is recorded only after the inner subscriber succeeds, so a failed
/// attempt is retried on redelivery. Deliveries of the same id are
/// serialized; distinct ids run concurrently.
///
/// Processed ids are remembered for `retention` and at most `capacity` of
/// them are kept, oldest forgotten first. A redelivery arriving after its id
/// was forgotten runs again, so the retention should exceed the queue's
/// redelivery window. Subscribers that need deduplication across restarts
/// must keep their own bookkeeping in their store.
pub struct Deduplicate<S> {
    inner: S,
    in_flight: DashMap<MessageId, Arc<Mutex<()>>>,
    seen: DashMap<MessageId, Instant>,
    retention: Duration,
    capacity: usize,
}

impl<S: EventSubscriber> Deduplicate<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            in_flight: DashMap::new(),
            seen: DashMap::new(),
            retention: DEFAULT_RETENTION,
            capacity: DEFAULT_CAPACITY,
        }
    }

    /// Sets how long a processed id is remembered.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Sets how many processed ids are remembered at most.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Returns true if the message id was processed and is still remembered.
    pub fn has_seen(&self, id: &MessageId) -> bool {
        self.seen
            .get(id)
            .is_some_and(|at| at.elapsed() < self.retention)
    }

    /// Number of ids currently remembered, expired ones included until the
    /// next prune.
    pub fn remembered(&self) -> usize {
        self.seen.len()
    }

    /// Returns the wrapped subscriber.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn remember(&self, id: MessageId) {
        self.seen.insert(id, Instant::now());
        if self.seen.len() > self.capacity {
            self.prune();
        }
    }

    /// Drops expired ids, then the oldest ones until within capacity.
    fn prune(&self) {
        let retention = self.retention;
        self.seen.retain(|_, at| at.elapsed() < retention);

        let excess = self.seen.len().saturating_sub(self.capacity);
        if excess == 0 {
            return;
        }
        let mut by_age: Vec<(Instant, MessageId)> =
            self.seen.iter().map(|entry| (*entry.value(), *entry.key())).collect();
        by_age.sort_unstable();
        for (_, id) in by_age.into_iter().take(excess) {
            self.seen.remove(&id);
        }
        tracing::debug!(
            subscriber = self.inner.name(),
            evicted = excess,
            "deduplication memory pruned"
        );
    }

    async fn deliver_once(&self, id: MessageId, event: &EventEnvelope) -> Result<(), BoxError> {
        let gate = self.in_flight.entry(id).or_default().value().clone();
        let _turn = gate.lock().await;

        if self.has_seen(&id) {
            tracing::debug!(
                subscriber = self.inner.name(),
                message_id = %id,
                "duplicate delivery skipped"
            );
            return Ok(());
        }

        self.inner.on_event(event).await?;
        self.remember(id);
        Ok(())
    }
}

#[async_trait]
impl<S: EventSubscriber> EventSubscriber for Deduplicate<S> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn on_event(&self, event: &EventEnvelope) -> Result<(), BoxError> {
        let id = event.message_id();
        let result = self.deliver_once(id, event).await;

        // Only the map holds the gate once nobody is waiting on the id.
        self.in_flight
            .remove_if(&id, |_, gate| Arc::strong_count(gate) == 1);
        result
    }
}
