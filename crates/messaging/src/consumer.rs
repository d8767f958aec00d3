//! The queue consumer loop.

use std::sync::Arc;
use std::time::Duration;

use events::{DeliveryReport, EventDispatcher, EventEnvelope};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::{
    DeadLetter, DeadLetterSink, IntegrationMessage, MessagingError, QueueClient, QueueEnvelope,
    Result,
};

/// Settings of one consumer.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Queue to consume.
    pub queue: String,

    /// How long a received message stays hidden from other consumers.
    pub visibility_timeout: Duration,

    /// Requeues allowed before a failing message is dead-lettered: a
    /// message is nacked `max_delivery_count + 1` times, and its next failed
    /// delivery moves it to the dead-letter sink.
    pub max_delivery_count: u32,

    /// First wait after an empty poll; doubles up to `max_idle_backoff`.
    pub idle_backoff: Duration,

    pub max_idle_backoff: Duration,

    /// How often visibility is renewed while subscribers run. Defaults to a
    /// third of the visibility timeout.
    pub renew_interval: Option<Duration>,
}

impl ConsumerConfig {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            visibility_timeout: Duration::from_secs(30),
            max_delivery_count: 5,
            idle_backoff: Duration::from_millis(50),
            max_idle_backoff: Duration::from_secs(2),
            renew_interval: None,
        }
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn with_max_delivery_count(mut self, count: u32) -> Self {
        self.max_delivery_count = count;
        self
    }

    pub fn with_idle_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.idle_backoff = initial;
        self.max_idle_backoff = max;
        self
    }

    pub fn with_renew_interval(mut self, interval: Duration) -> Self {
        self.renew_interval = Some(interval);
        self
    }

    fn renew_every(&self) -> Duration {
        self.renew_interval
            .unwrap_or(self.visibility_timeout / 3)
            .max(Duration::from_millis(1))
    }
}

/// What happened to one received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Every subscriber succeeded; the message was removed.
    Acked,
    /// A subscriber failed; the message is visible again.
    Requeued,
    /// The message was moved to the dead-letter sink and removed.
    DeadLettered,
}

impl DeliveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryOutcome::Acked => "acked",
            DeliveryOutcome::Requeued => "requeued",
            DeliveryOutcome::DeadLettered => "dead_lettered",
        }
    }
}

/// Pulls integration messages off a queue and hands them to subscribers.
///
/// Subscribers are registered on an [`EventDispatcher`] (the integration
/// channel) and receive the decoded [`EventEnvelope`]; its
/// [`message_id`](EventEnvelope::message_id) is the queue message id, and
/// the `delivery_count` metadata entry tells them which attempt this is.
/// Delivery is at least once, so subscribers must be idempotent.
///
/// Clones share the queue, subscribers and sink; spawn one clone per worker.
pub struct MessageDispatcher<Q> {
    queue: Q,
    subscribers: Arc<EventDispatcher>,
    dead_letters: Arc<dyn DeadLetterSink>,
    config: ConsumerConfig,
}

impl<Q: Clone> Clone for MessageDispatcher<Q> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            subscribers: Arc::clone(&self.subscribers),
            dead_letters: Arc::clone(&self.dead_letters),
            config: self.config.clone(),
        }
    }
}

impl<Q: QueueClient> MessageDispatcher<Q> {
    pub fn new(
        queue: Q,
        subscribers: Arc<EventDispatcher>,
        dead_letters: Arc<dyn DeadLetterSink>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            queue,
            subscribers,
            dead_letters,
            config,
        }
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Receives and processes at most one message.
    ///
    /// Returns `None` when the queue had nothing available.
    #[tracing::instrument(skip(self), fields(queue = %self.config.queue))]
    pub async fn poll_once(&self) -> Result<Option<DeliveryOutcome>> {
        let Some(envelope) = self
            .queue
            .pop(&self.config.queue, self.config.visibility_timeout)
            .await?
        else {
            return Ok(None);
        };

        let outcome = self.process(envelope).await?;
        metrics::counter!("consumer_messages_total", "outcome" => outcome.as_str()).increment(1);
        Ok(Some(outcome))
    }

    #[tracing::instrument(
        skip_all,
        fields(message_id = %envelope.message_id, delivery_count = envelope.delivery_count)
    )]
    async fn process(&self, envelope: QueueEnvelope) -> Result<DeliveryOutcome> {
        let decoded = IntegrationMessage::decode(envelope.message_id, &envelope.payload)
            .and_then(|message| message.to_event());
        let mut event = match decoded {
            Ok(event) => event,
            Err(error) => return self.dead_letter(envelope, error.to_string()).await,
        };
        event.metadata.insert(
            "delivery_count".to_string(),
            serde_json::json!(envelope.delivery_count),
        );

        let report = self.deliver(&envelope, &event).await;
        if report.is_clean() {
            self.queue.ack(&envelope).await?;
            tracing::debug!("message acked");
            return Ok(DeliveryOutcome::Acked);
        }

        // Every earlier delivery ended in a nack or an expired lease.
        let requeued = envelope.delivery_count.saturating_sub(1);
        if requeued > self.config.max_delivery_count {
            let poison = MessagingError::PoisonMessage {
                message_id: envelope.message_id,
                delivery_count: envelope.delivery_count,
            };
            return self.dead_letter(envelope, poison.to_string()).await;
        }

        self.queue.nack(&envelope).await?;
        tracing::info!(failures = report.failures.len(), "message requeued");
        Ok(DeliveryOutcome::Requeued)
    }

    /// Runs the subscribers, renewing the message's visibility meanwhile.
    async fn deliver(&self, envelope: &QueueEnvelope, event: &EventEnvelope) -> DeliveryReport {
        let every = self.config.renew_every();
        let mut renew = tokio::time::interval_at(Instant::now() + every, every);

        let work = self.subscribers.dispatch(event);
        tokio::pin!(work);

        loop {
            tokio::select! {
                report = &mut work => return report,
                _ = renew.tick() => {
                    if let Err(error) = self
                        .queue
                        .extend_visibility(envelope, self.config.visibility_timeout)
                        .await
                    {
                        tracing::warn!(error = %error, "failed to extend visibility");
                    }
                }
            }
        }
    }

    async fn dead_letter(&self, envelope: QueueEnvelope, reason: String) -> Result<DeliveryOutcome> {
        tracing::warn!(reason = %reason, "dead-lettering message");
        self.dead_letters
            .send(DeadLetter::new(envelope.clone(), reason))
            .await?;
        self.queue.ack(&envelope).await?;
        Ok(DeliveryOutcome::DeadLettered)
    }

    /// Consumes until `shutdown` turns true or its sender is dropped.
    ///
    /// Empty polls back off exponentially; errors are logged and followed by
    /// the longest backoff.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(queue = %self.config.queue, "consumer started");
        let mut idle = self.config.idle_backoff;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let wait = match self.poll_once().await {
                Ok(Some(_)) => {
                    idle = self.config.idle_backoff;
                    continue;
                }
                Ok(None) => {
                    let wait = idle;
                    idle = (idle * 2).min(self.config.max_idle_backoff);
                    wait
                }
                Err(error) => {
                    tracing::error!(error = %error, "consumer poll failed");
                    self.config.max_idle_backoff
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!(queue = %self.config.queue, "consumer stopped");
    }
}
