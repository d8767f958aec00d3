//! Forwards integration events from the domain channel to the queue.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::MessageId;
use events::{BoxError, EventDispatcherBuilder, EventEnvelope, EventSubscriber};

use crate::{IntegrationMessage, MessagingError, QueueClient, Result};

/// Bounded exponential backoff for publish attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Growth factor between delays. Values below 1.0 count as 1.0.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that tries once and never waits.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    /// Sets the growth factor between delays, at least 1.0.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    /// Delay before the attempt following failed attempt `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as i32;
        // NaN.max(1.0) is 1.0 as well.
        let multiplier = self.multiplier.max(1.0);
        let delay = self.initial_backoff.as_secs_f64() * multiplier.powi(exponent);
        let capped = delay.min(self.max_backoff.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.max_backoff)
    }
}

/// Which events leave the process, and where they go.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Queue used by integration events without an explicit route.
    pub default_queue: String,

    /// Integration event types, each mapped to its destination queue.
    pub routes: BTreeMap<String, String>,

    pub retry: RetryPolicy,
}

impl BrokerConfig {
    pub fn new(default_queue: impl Into<String>) -> Self {
        Self {
            default_queue: default_queue.into(),
            routes: BTreeMap::new(),
            retry: RetryPolicy::default(),
        }
    }

    /// Marks an event type as an integration event on the default queue.
    pub fn integration_event(mut self, event_type: impl Into<String>) -> Self {
        let queue = self.default_queue.clone();
        self.routes.insert(event_type.into(), queue);
        self
    }

    /// Marks an event type as an integration event on a specific queue.
    pub fn route(mut self, event_type: impl Into<String>, queue: impl Into<String>) -> Self {
        self.routes.insert(event_type.into(), queue.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Returns the destination of an event type, if it is an integration event.
    pub fn queue_for(&self, event_type: &str) -> Option<&str> {
        self.routes.get(event_type).map(String::as_str)
    }
}

/// Publishes integration events to the queue.
///
/// The broker is an [`EventSubscriber`] on the domain channel. Use
/// [`attach`](Self::attach) to subscribe it to every configured integration
/// event type.
pub struct MessageBroker<Q> {
    queue: Q,
    config: BrokerConfig,
}

impl<Q: QueueClient + 'static> MessageBroker<Q> {
    pub fn new(queue: Q, config: BrokerConfig) -> Self {
        Self { queue, config }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Subscribes the broker to its integration event types.
    pub fn attach(self: Arc<Self>, mut builder: EventDispatcherBuilder) -> EventDispatcherBuilder {
        let event_types: Vec<String> = self.config.routes.keys().cloned().collect();
        for event_type in event_types {
            builder = builder.subscribe_shared(event_type, Arc::clone(&self) as Arc<dyn EventSubscriber>);
        }
        builder
    }

    /// Pushes a message, retrying transient failures per the retry policy.
    pub async fn publish(&self, message: &IntegrationMessage) -> Result<()> {
        let payload = message.encode()?;
        self.publish_encoded(message.message_id, &message.queue, &payload)
            .await
    }

    /// Pushes an already encoded message, retrying like [`publish`](Self::publish).
    #[tracing::instrument(skip(self, payload), fields(message_id = %message_id, queue = %queue))]
    pub async fn publish_encoded(
        &self,
        message_id: MessageId,
        queue: &str,
        payload: &[u8],
    ) -> Result<()> {
        let policy = &self.config.retry;
        let mut attempt = 1;

        loop {
            match self.queue.push(queue, message_id, payload).await {
                Ok(()) => {
                    metrics::counter!("broker_messages_published_total").increment(1);
                    tracing::debug!(attempt, "integration message published");
                    return Ok(());
                }
                Err(error) if error.is_transient() && attempt < policy.max_attempts => {
                    let delay = policy.delay_after(attempt);
                    tracing::warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "publish failed, retrying"
                    );
                    metrics::counter!("broker_publish_retries_total").increment(1);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) if error.is_transient() => {
                    tracing::error!(attempts = attempt, error = %error, "publish attempts exhausted");
                    return Err(MessagingError::PublishExhausted {
                        message_id,
                        queue: queue.to_string(),
                        attempts: attempt,
                        source: Box::new(error),
                    });
                }
                Err(error) => return Err(error),
            }
        }
    }
}

#[async_trait]
impl<Q: QueueClient + 'static> EventSubscriber for MessageBroker<Q> {
    fn name(&self) -> &str {
        "message-broker"
    }

    async fn on_event(&self, event: &EventEnvelope) -> std::result::Result<(), BoxError> {
        let Some(queue) = self.config.queue_for(&event.event_type) else {
            return Ok(());
        };

        let message = IntegrationMessage::from_event(event, queue)?;
        self.publish(&message).await?;
        Ok(())
    }
}
