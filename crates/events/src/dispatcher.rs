//! Synchronous in-process event fan-out.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;

use crate::{EventDeliveryError, EventEnvelope, EventSubscriber};

/// Outcome of dispatching one or more events.
#[derive(Debug, Default)]
pub struct DeliveryReport {
    /// Number of events dispatched.
    pub events: usize,

    /// Number of successful subscriber invocations.
    pub delivered: usize,

    /// Subscriber failures, in the order they happened.
    pub failures: Vec<EventDeliveryError>,
}

impl DeliveryReport {
    /// Returns true if every subscriber succeeded.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Folds another report into this one.
    pub fn merge(&mut self, other: DeliveryReport) {
        self.events += other.events;
        self.delivered += other.delivered;
        self.failures.extend(other.failures);
    }
}

/// Dispatches events to the subscribers registered for their type.
///
/// Subscribers are invoked in registration order on the calling task;
/// catch-all subscribers run after the type-specific ones. A failing or
/// panicking subscriber is logged and recorded in the [`DeliveryReport`],
/// and dispatch carries on with the next subscriber.
///
/// The registry is immutable once built; share the dispatcher behind an
/// `Arc` to use it from many tasks.
pub struct EventDispatcher {
    channel: String,
    by_type: HashMap<String, Vec<Arc<dyn EventSubscriber>>>,
    catch_all: Vec<Arc<dyn EventSubscriber>>,
}

impl EventDispatcher {
    /// Starts building a dispatcher for the named channel.
    pub fn builder(channel: impl Into<String>) -> EventDispatcherBuilder {
        EventDispatcherBuilder {
            channel: channel.into(),
            by_type: HashMap::new(),
            catch_all: Vec::new(),
        }
    }

    /// Returns a dispatcher with no subscribers.
    pub fn empty(channel: impl Into<String>) -> Self {
        Self::builder(channel).build()
    }

    /// Returns the channel name (used as a metrics label).
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Returns the number of subscribers an event of this type reaches.
    pub fn subscriber_count(&self, event_type: &str) -> usize {
        self.by_type.get(event_type).map_or(0, Vec::len) + self.catch_all.len()
    }

    /// Returns the event types with dedicated subscribers.
    pub fn event_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.by_type.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    fn subscribers_for<'a>(
        &'a self,
        event_type: &str,
    ) -> impl Iterator<Item = &'a Arc<dyn EventSubscriber>> {
        self.by_type
            .get(event_type)
            .into_iter()
            .flatten()
            .chain(self.catch_all.iter())
    }

    /// Delivers a single event to all of its subscribers.
    #[tracing::instrument(
        skip(self, event),
        fields(channel = %self.channel, event_type = %event.event_type, event_id = %event.event_id)
    )]
    pub async fn dispatch(&self, event: &EventEnvelope) -> DeliveryReport {
        let mut report = DeliveryReport {
            events: 1,
            ..DeliveryReport::default()
        };

        for subscriber in self.subscribers_for(&event.event_type) {
            let outcome = AssertUnwindSafe(subscriber.on_event(event))
                .catch_unwind()
                .await;

            match outcome {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(source)) => {
                    tracing::warn!(
                        subscriber = subscriber.name(),
                        error = %source,
                        "subscriber failed"
                    );
                    report.failures.push(EventDeliveryError::Failed {
                        subscriber: subscriber.name().to_string(),
                        event_type: event.event_type.clone(),
                        event_id: event.event_id,
                        source,
                    });
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    tracing::error!(
                        subscriber = subscriber.name(),
                        panic = %message,
                        "subscriber panicked"
                    );
                    report.failures.push(EventDeliveryError::Panicked {
                        subscriber: subscriber.name().to_string(),
                        event_type: event.event_type.clone(),
                        event_id: event.event_id,
                        message,
                    });
                }
            }
        }

        if !report.is_clean() {
            metrics::counter!("event_delivery_failures_total", "channel" => self.channel.clone())
                .increment(report.failures.len() as u64);
        }
        metrics::counter!("events_dispatched_total", "channel" => self.channel.clone())
            .increment(1);

        report
    }

    /// Delivers an ordered batch of events, one event at a time.
    ///
    /// Every event of the batch is dispatched even if earlier ones failed.
    pub async fn dispatch_batch(&self, events: &[EventEnvelope]) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        for event in events {
            report.merge(self.dispatch(event).await);
        }
        report
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Registration side of [`EventDispatcher`].
pub struct EventDispatcherBuilder {
    channel: String,
    by_type: HashMap<String, Vec<Arc<dyn EventSubscriber>>>,
    catch_all: Vec<Arc<dyn EventSubscriber>>,
}

impl EventDispatcherBuilder {
    /// Registers a subscriber for one event type.
    pub fn subscribe<S>(self, event_type: impl Into<String>, subscriber: S) -> Self
    where
        S: EventSubscriber + 'static,
    {
        self.subscribe_shared(event_type, Arc::new(subscriber))
    }

    /// Registers an already shared subscriber for one event type.
    ///
    /// The same instance may be registered under several types.
    pub fn subscribe_shared(
        mut self,
        event_type: impl Into<String>,
        subscriber: Arc<dyn EventSubscriber>,
    ) -> Self {
        self.by_type
            .entry(event_type.into())
            .or_default()
            .push(subscriber);
        self
    }

    /// Registers a subscriber that receives every event.
    pub fn subscribe_all<S>(mut self, subscriber: S) -> Self
    where
        S: EventSubscriber + 'static,
    {
        self.catch_all.push(Arc::new(subscriber));
        self
    }

    /// Freezes the registry.
    pub fn build(self) -> EventDispatcher {
        tracing::debug!(
            channel = %self.channel,
            event_types = self.by_type.len(),
            catch_all = self.catch_all.len(),
            "event dispatcher built"
        );
        EventDispatcher {
            channel: self.channel,
            by_type: self.by_type,
            catch_all: self.catch_all,
        }
    }
}
