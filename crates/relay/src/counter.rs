//! A subscriber that tallies events by type.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use events::{BoxError, EventEnvelope, EventSubscriber};
use tokio::sync::RwLock;

/// Counts the events it receives, per event type.
///
/// Clones share their counts. Not idempotent on its own: wrap it in
/// [`Deduplicate`](events::Deduplicate) when it sits behind the queue.
#[derive(Clone, Default)]
pub struct EventCounter {
    counts: Arc<RwLock<BTreeMap<String, u64>>>,
}

impl EventCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns how many events of `event_type` were counted.
    pub async fn count(&self, event_type: &str) -> u64 {
        self.counts
            .read()
            .await
            .get(event_type)
            .copied()
            .unwrap_or(0)
    }

    /// Returns the count of every event type seen so far.
    pub async fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counts.read().await.clone()
    }

    pub async fn total(&self) -> u64 {
        self.counts.read().await.values().sum()
    }
}

#[async_trait]
impl EventSubscriber for EventCounter {
    fn name(&self) -> &str {
        "event-counter"
    }

    async fn on_event(&self, event: &EventEnvelope) -> Result<(), BoxError> {
        let mut counts = self.counts.write().await;
        let count = counts.entry(event.event_type.clone()).or_insert(0);
        *count += 1;

        tracing::info!(
            event_type = %event.event_type,
            message_id = %event.message_id(),
            count = *count,
            "event counted"
        );
        Ok(())
    }
}
