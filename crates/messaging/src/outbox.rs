//! Transactional outbox: integration messages are recorded with the command
//! that raised them and pushed to the queue afterwards, so a crash between
//! commit and publish delays a message instead of losing it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dispatch::CommitHook;
use events::{BoxError, EventDispatcherBuilder, EventEnvelope, EventSubscriber};
use store::{OutboxRecord, OutboxStore};
use tokio::sync::{Mutex, watch};

use crate::{BrokerConfig, IntegrationMessage, MessageBroker, QueueClient, Result};

/// Stages one outbox record per integration event before the unit of work
/// commits.
///
/// Install it with
/// [`TransactionalDispatcher::with_commit_hook`](dispatch::TransactionalDispatcher::with_commit_hook).
/// Events without a route are skipped.
pub struct OutboxWriter {
    config: BrokerConfig,
}

impl OutboxWriter {
    pub fn new(config: BrokerConfig) -> Self {
        Self { config }
    }

    fn record_for(&self, event: &EventEnvelope) -> Result<Option<OutboxRecord>> {
        let Some(queue) = self.config.queue_for(&event.event_type) else {
            return Ok(None);
        };

        let message = IntegrationMessage::from_event(event, queue)?;
        Ok(Some(OutboxRecord {
            payload: message.encode()?,
            message_id: message.message_id,
            queue: message.queue,
            message_type: message.message_type,
            position: event.sequence,
            recorded_at: event.timestamp,
        }))
    }
}

#[async_trait]
impl<S: OutboxStore> CommitHook<S> for OutboxWriter {
    fn name(&self) -> &str {
        "outbox-writer"
    }

    async fn before_commit(
        &self,
        store: &S,
        transaction: &mut S::Transaction,
        events: &[EventEnvelope],
    ) -> std::result::Result<(), BoxError> {
        let mut staged = 0;
        for event in events {
            if let Some(record) = self.record_for(event)? {
                store.stage_outbox(transaction, record).await?;
                staged += 1;
            }
        }
        if staged > 0 {
            tracing::debug!(staged, "integration messages staged in outbox");
        }
        Ok(())
    }
}

/// Outcome of one [`OutboxRelay::drain`] pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainResult {
    /// Records pushed and marked published.
    pub published: usize,
    /// Records that could not be pushed; the pass stops at the first one.
    pub failed: usize,
}

/// Pushes pending outbox records through the broker.
///
/// Records are published oldest first and marked published only after the
/// queue accepted them. A pass stops at the first failure so later records
/// never overtake an earlier one; the failed record stays pending for the
/// next pass. A crash between push and mark publishes the record again,
/// which the queue and [`Deduplicate`](events::Deduplicate) absorb.
///
/// The relay can poll on its own with [`run`](Self::run), be attached to the
/// domain channel with [`attach`](Self::attach) to drain right after each
/// commit, or both.
pub struct OutboxRelay<Q, S> {
    broker: Arc<MessageBroker<Q>>,
    store: Arc<S>,
    batch_size: usize,
    poll_interval: Duration,
    draining: Mutex<()>,
}

impl<Q, S> OutboxRelay<Q, S>
where
    Q: QueueClient + 'static,
    S: OutboxStore,
{
    pub fn new(broker: Arc<MessageBroker<Q>>, store: Arc<S>) -> Self {
        Self {
            broker,
            store,
            batch_size: 100,
            poll_interval: Duration::from_millis(500),
            draining: Mutex::new(()),
        }
    }

    /// Sets the most records published per pass.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Sets the pause between passes of [`run`](Self::run) once the outbox
    /// is empty.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Publishes up to one batch of pending records.
    #[tracing::instrument(skip(self))]
    pub async fn drain(&self) -> Result<DrainResult> {
        let _pass = self.draining.lock().await;
        let pending = self.store.pending_outbox(self.batch_size).await?;
        let mut result = DrainResult::default();

        for record in pending {
            let pushed = self
                .broker
                .publish_encoded(record.message_id, &record.queue, &record.payload)
                .await;
            if let Err(error) = pushed {
                tracing::warn!(
                    message_id = %record.message_id,
                    queue = %record.queue,
                    error = %error,
                    "outbox record left pending"
                );
                metrics::counter!("outbox_publish_failures_total").increment(1);
                result.failed += 1;
                break;
            }

            self.store.mark_published(record.message_id).await?;
            metrics::counter!("outbox_records_published_total").increment(1);
            result.published += 1;
        }

        if result.published > 0 {
            tracing::debug!(published = result.published, "outbox drained");
        }
        Ok(result)
    }

    /// Drains the outbox until `shutdown` turns true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(batch_size = self.batch_size, "outbox relay started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.drain().await {
                Ok(result) if result.failed == 0 && result.published == self.batch_size => {
                    continue;
                }
                Ok(_) => {}
                Err(error) => tracing::error!(error = %error, "outbox drain failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!("outbox relay stopped");
    }

    /// Subscribes the relay to the broker's integration event types, so each
    /// commit that staged records triggers a drain.
    pub fn attach(self: Arc<Self>, mut builder: EventDispatcherBuilder) -> EventDispatcherBuilder {
        let event_types: Vec<String> = self.broker.config().routes.keys().cloned().collect();
        for event_type in event_types {
            builder =
                builder.subscribe_shared(event_type, Arc::clone(&self) as Arc<dyn EventSubscriber>);
        }
        builder
    }
}

#[async_trait]
impl<Q, S> EventSubscriber for OutboxRelay<Q, S>
where
    Q: QueueClient + 'static,
    S: OutboxStore,
{
    fn name(&self) -> &str {
        "outbox-relay"
    }

    async fn on_event(&self, event: &EventEnvelope) -> std::result::Result<(), BoxError> {
        let result = self.drain().await?;
        if result.failed > 0 {
            return Err(format!(
                "outbox publish failed after {}; message {} stays pending",
                event.event_type,
                event.message_id()
            )
            .into());
        }
        Ok(())
    }
}
