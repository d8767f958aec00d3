//! End-to-end booking flow: command, commit, release, queue and consumer.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use dispatch::{
    BoxError, Command, CommandContext, CommandHandler, CommandRegistry, TransactionalDispatcher,
};
use events::{DomainEvent, EventDispatcher, EventEnvelope, EventSubscriber, MessageId};
use messaging::{
    BrokerConfig, ConsumerConfig, DeliveryOutcome, DrainResult, InMemoryQueue, IntegrationMessage,
    MessageBroker, MessageDispatcher, OutboxRelay, OutboxWriter, QueueClient, QueueDeadLetterSink,
    RetryPolicy,
};
use relay::EventCounter;
use serde::{Deserialize, Serialize};
use store::{InMemoryStore, OutboxStore, Store};

const QUEUE: &str = "bookings";
const DEAD_LETTER_QUEUE: &str = "bookings.dead-letter";

#[derive(Debug, Serialize, Deserialize)]
struct BookingCreated {
    booking_id: String,
    couch_id: String,
    nights: u32,
}

impl DomainEvent for BookingCreated {
    fn event_type(&self) -> &'static str {
        "BookingCreated"
    }

    fn identity(&self) -> Option<String> {
        Some(self.booking_id.clone())
    }
}

struct CreateBooking {
    couch_id: String,
    nights: u32,
}

impl Command for CreateBooking {
    type Output = String;

    fn command_type() -> &'static str {
        "CreateBooking"
    }
}

/// Books a free couch. Booking ids are `b1`, `b2`, ... in commit order.
struct CreateBookingHandler;

#[async_trait]
impl CommandHandler<CreateBooking, InMemoryStore> for CreateBookingHandler {
    async fn handle(
        &self,
        command: CreateBooking,
        ctx: &mut CommandContext<'_, InMemoryStore>,
    ) -> Result<String, BoxError> {
        if command.nights == 0 {
            return Err("nights must be positive".into());
        }

        let couch_key = format!("couch:{}", command.couch_id);
        if ctx.transaction().get(&couch_key).await.is_some() {
            return Err("couch unavailable".into());
        }

        let next = ctx
            .transaction()
            .get_as::<u64>("bookings:last_id")
            .await?
            .unwrap_or(0)
            + 1;
        let booking_id = format!("b{next}");

        let tx = ctx.transaction_mut();
        tx.put("bookings:last_id", &next)?;
        tx.put(couch_key, &booking_id)?;
        tx.put(
            format!("booking:{booking_id}"),
            &serde_json::json!({ "couch_id": command.couch_id, "nights": command.nights }),
        )?;

        ctx.raise(&BookingCreated {
            booking_id: booking_id.clone(),
            couch_id: command.couch_id,
            nights: command.nights,
        })?;
        Ok(booking_id)
    }
}

/// Fails its first `failures` deliveries.
struct Flaky {
    failures_left: AtomicU32,
    calls: Arc<AtomicU32>,
}

impl Flaky {
    fn new(failures: u32) -> (Self, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        (
            Self {
                failures_left: AtomicU32::new(failures),
                calls: Arc::clone(&calls),
            },
            calls,
        )
    }
}

#[async_trait]
impl EventSubscriber for Flaky {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn on_event(&self, _event: &EventEnvelope) -> Result<(), BoxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err("mailer offline".into());
        }
        Ok(())
    }
}

struct Harness {
    store: InMemoryStore,
    queue: InMemoryQueue,
    counter: EventCounter,
    broker: Arc<MessageBroker<InMemoryQueue>>,
    commands: TransactionalDispatcher<InMemoryStore>,
}

fn harness() -> Harness {
    let store = InMemoryStore::new();
    let queue = InMemoryQueue::new();
    let counter = EventCounter::new();

    let broker = Arc::new(MessageBroker::new(queue.clone(), broker_config()));
    let domain = Arc::clone(&broker)
        .attach(EventDispatcher::builder("domain").subscribe("BookingCreated", counter.clone()))
        .build();

    let registry = CommandRegistry::new()
        .with::<CreateBooking, _>(CreateBookingHandler)
        .unwrap();
    let commands = TransactionalDispatcher::new(Arc::new(store.clone()), registry, Arc::new(domain));

    Harness {
        store,
        queue,
        counter,
        broker,
        commands,
    }
}

fn broker_config() -> BrokerConfig {
    BrokerConfig::new(QUEUE)
        .integration_event("BookingCreated")
        .with_retry(RetryPolicy::no_retry())
}

struct OutboxHarness {
    store: InMemoryStore,
    queue: InMemoryQueue,
    relay: Arc<OutboxRelay<InMemoryQueue, InMemoryStore>>,
    commands: TransactionalDispatcher<InMemoryStore>,
}

/// Producer that records integration messages in its outbox. With
/// `drain_after_commit` the relay also runs as a domain subscriber.
fn outbox_harness(drain_after_commit: bool) -> OutboxHarness {
    let store = InMemoryStore::new();
    let queue = InMemoryQueue::new();

    let broker = Arc::new(MessageBroker::new(queue.clone(), broker_config()));
    let relay = Arc::new(OutboxRelay::new(broker, Arc::new(store.clone())));

    let mut domain = EventDispatcher::builder("domain");
    if drain_after_commit {
        domain = Arc::clone(&relay).attach(domain);
    }

    let registry = CommandRegistry::new()
        .with::<CreateBooking, _>(CreateBookingHandler)
        .unwrap();
    let commands =
        TransactionalDispatcher::new(Arc::new(store.clone()), registry, Arc::new(domain.build()))
            .with_commit_hook(OutboxWriter::new(broker_config()));

    OutboxHarness {
        store,
        queue,
        relay,
        commands,
    }
}

fn consumer(
    queue: &InMemoryQueue,
    subscribers: EventDispatcher,
    max_delivery_count: u32,
) -> MessageDispatcher<InMemoryQueue> {
    MessageDispatcher::new(
        queue.clone(),
        Arc::new(subscribers),
        Arc::new(QueueDeadLetterSink::new(queue.clone(), DEAD_LETTER_QUEUE)),
        ConsumerConfig::new(QUEUE).with_max_delivery_count(max_delivery_count),
    )
}

fn booking_message_id(booking_id: &str) -> MessageId {
    MessageId::derive("BookingCreated", booking_id)
}

async fn book(h: &Harness, couch_id: &str) -> String {
    h.commands
        .dispatch(CreateBooking {
            couch_id: couch_id.to_string(),
            nights: 3,
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn created_booking_is_counted_and_published() {
    let h = harness();

    let booking_id = book(&h, "c1").await;

    assert_eq!(booking_id, "b1");
    assert!(h.store.get("booking:b1").await.is_some());
    assert_eq!(h.counter.count("BookingCreated").await, 1);
    assert_eq!(h.queue.len(QUEUE).await, 1);
    assert!(h.queue.contains(QUEUE, booking_message_id("b1")).await);

    let payload = &h.queue.ready_payloads(QUEUE).await[0];
    let message = IntegrationMessage::decode(booking_message_id("b1"), payload).unwrap();
    assert_eq!(message.queue, QUEUE);
    assert_eq!(message.message_type, "BookingCreated");
    let created: BookingCreated = message.to_event().unwrap().decode().unwrap();
    assert_eq!(created.couch_id, "c1");
    assert_eq!(created.nights, 3);
}

#[tokio::test]
async fn unavailable_couch_rolls_back_and_publishes_nothing() {
    let h = harness();
    let mut tx = h.store.begin().await.unwrap();
    tx.put("couch:c1", &"b0").unwrap();
    h.store.commit(tx).await.unwrap();

    let error = h
        .commands
        .dispatch(CreateBooking {
            couch_id: "c1".to_string(),
            nights: 3,
        })
        .await
        .unwrap_err();

    assert_eq!(error.outcome(), "rolled_back");
    assert_eq!(
        error.handler_error().map(ToString::to_string).as_deref(),
        Some("couch unavailable")
    );
    assert_eq!(h.store.rollback_count(), 1);
    assert!(h.store.get("bookings:last_id").await.is_none());
    assert_eq!(h.counter.count("BookingCreated").await, 0);
    assert_eq!(h.queue.len(QUEUE).await, 0);
}

#[tokio::test]
async fn rolled_back_booking_does_not_consume_an_id() {
    let h = harness();

    book(&h, "c1").await;
    let error = h
        .commands
        .dispatch(CreateBooking {
            couch_id: "c1".to_string(),
            nights: 2,
        })
        .await
        .unwrap_err();
    assert_eq!(error.outcome(), "rolled_back");
    let second = book(&h, "c2").await;

    assert_eq!(second, "b2");
    assert_eq!(h.counter.count("BookingCreated").await, 2);
    assert_eq!(h.queue.len(QUEUE).await, 2);
}

#[tokio::test]
async fn failed_delivery_is_redelivered_with_next_count() {
    let h = harness();
    book(&h, "c1").await;

    let (subscriber, calls) = Flaky::new(1);
    let consumer = consumer(
        &h.queue,
        EventDispatcher::builder("integration")
            .subscribe("BookingCreated", subscriber)
            .build(),
        5,
    );

    assert_eq!(
        consumer.poll_once().await.unwrap(),
        Some(DeliveryOutcome::Requeued)
    );

    let redelivered = h
        .queue
        .pop(QUEUE, std::time::Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(redelivered.message_id, booking_message_id("b1"));
    assert_eq!(redelivered.delivery_count, 2);
    h.queue.nack(&redelivered).await.unwrap();

    assert_eq!(
        consumer.poll_once().await.unwrap(),
        Some(DeliveryOutcome::Acked)
    );
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.queue.len(QUEUE).await, 0);
}

#[tokio::test]
async fn poison_booking_lands_in_dead_letter_queue_once() {
    let h = harness();
    book(&h, "c1").await;

    let (subscriber, calls) = Flaky::new(u32::MAX);
    let consumer = consumer(
        &h.queue,
        EventDispatcher::builder("integration")
            .subscribe("BookingCreated", subscriber)
            .build(),
        2,
    );

    let mut outcomes = Vec::new();
    while let Some(outcome) = consumer.poll_once().await.unwrap() {
        outcomes.push(outcome);
    }

    assert_eq!(
        outcomes,
        vec![
            DeliveryOutcome::Requeued,
            DeliveryOutcome::Requeued,
            DeliveryOutcome::Requeued,
            DeliveryOutcome::DeadLettered
        ]
    );
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(h.queue.len(QUEUE).await, 0);
    assert_eq!(h.queue.len(DEAD_LETTER_QUEUE).await, 1);
    assert!(
        h.queue
            .contains(DEAD_LETTER_QUEUE, booking_message_id("b1"))
            .await
    );
}

#[tokio::test]
async fn republished_booking_is_counted_once_downstream() {
    let h = harness();
    book(&h, "c1").await;

    let downstream = EventCounter::new();
    let consumer = consumer(
        &h.queue,
        relay::integration_subscribers(downstream.clone()),
        5,
    );
    assert_eq!(
        consumer.poll_once().await.unwrap(),
        Some(DeliveryOutcome::Acked)
    );

    // A producer that crashed after pushing but before recording the push
    // publishes the same fact again.
    let event = EventEnvelope::from_event(&BookingCreated {
        booking_id: "b1".to_string(),
        couch_id: "c1".to_string(),
        nights: 3,
    })
    .unwrap()
    .build();
    let message = IntegrationMessage::from_event(&event, QUEUE).unwrap();
    assert_eq!(message.message_id, booking_message_id("b1"));
    h.broker.publish(&message).await.unwrap();
    assert_eq!(h.queue.len(QUEUE).await, 1);

    assert_eq!(
        consumer.poll_once().await.unwrap(),
        Some(DeliveryOutcome::Acked)
    );
    assert_eq!(downstream.count("BookingCreated").await, 1);
    assert_eq!(h.queue.len(QUEUE).await, 0);
}

#[tokio::test]
async fn booking_committed_before_a_crash_is_published_on_recovery() {
    let h = outbox_harness(false);

    // The producer stops after commit: nothing drains the outbox.
    let booking_id = h
        .commands
        .dispatch(CreateBooking {
            couch_id: "c1".to_string(),
            nights: 3,
        })
        .await
        .unwrap();
    assert_eq!(booking_id, "b1");
    assert!(h.store.get("booking:b1").await.is_some());
    assert_eq!(h.queue.len(QUEUE).await, 0);
    assert_eq!(h.store.pending_outbox(10).await.unwrap().len(), 1);

    // A relay started later finds the committed record.
    let result = h.relay.drain().await.unwrap();

    assert_eq!(result, DrainResult { published: 1, failed: 0 });
    assert!(h.queue.contains(QUEUE, booking_message_id("b1")).await);
    assert!(h.store.pending_outbox(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn rolled_back_booking_leaves_nothing_in_the_outbox() {
    let h = outbox_harness(true);

    h.commands
        .dispatch(CreateBooking {
            couch_id: "c1".to_string(),
            nights: 0,
        })
        .await
        .unwrap_err();

    assert!(h.store.pending_outbox(10).await.unwrap().is_empty());
    assert_eq!(h.queue.len(QUEUE).await, 0);
}

#[tokio::test]
async fn exhausted_publish_stays_in_the_outbox_until_retried() {
    let h = outbox_harness(true);
    h.queue.fail_next_pushes(1);

    let dispatched = h
        .commands
        .dispatch_reported(CreateBooking {
            couch_id: "c1".to_string(),
            nights: 3,
        })
        .await
        .unwrap();

    assert!(!dispatched.report.is_clean());
    assert_eq!(h.queue.len(QUEUE).await, 0);
    assert_eq!(h.store.pending_outbox(10).await.unwrap().len(), 1);

    let retried = h.relay.drain().await.unwrap();

    assert_eq!(retried.published, 1);
    assert!(h.queue.contains(QUEUE, booking_message_id("b1")).await);
    assert!(h.store.pending_outbox(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn outbox_publishes_on_commit_when_relay_is_attached() {
    let h = outbox_harness(true);

    let dispatched = h
        .commands
        .dispatch_reported(CreateBooking {
            couch_id: "c1".to_string(),
            nights: 3,
        })
        .await
        .unwrap();

    assert!(dispatched.report.is_clean());
    assert!(h.queue.contains(QUEUE, booking_message_id("b1")).await);
    assert!(h.store.pending_outbox(10).await.unwrap().is_empty());
}
