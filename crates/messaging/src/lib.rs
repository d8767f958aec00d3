//! Integration messaging: from released domain events to queue consumers.
//!
//! - [`MessageBroker`] subscribes to the domain channel and pushes
//!   integration events to a queue as [`IntegrationMessage`]s.
//! - [`QueueClient`] is the durable queue boundary, implemented by
//!   [`InMemoryQueue`] and [`RedisQueue`].
//! - [`MessageDispatcher`] is the consumer loop: it pops messages, runs the
//!   integration subscribers and acks, nacks or dead-letters each message.
//! - [`OutboxWriter`] records integration messages in the command's own
//!   transaction and [`OutboxRelay`] publishes them after commit.

pub mod broker;
pub mod consumer;
pub mod dead_letter;
pub mod error;
pub mod memory;
pub mod message;
pub mod outbox;
pub mod queue;
pub mod redis_queue;

pub use broker::{BrokerConfig, MessageBroker, RetryPolicy};
pub use consumer::{ConsumerConfig, DeliveryOutcome, MessageDispatcher};
pub use dead_letter::{DeadLetter, DeadLetterSink, InMemoryDeadLetterSink, QueueDeadLetterSink};
pub use error::{MessagingError, Result};
pub use memory::InMemoryQueue;
pub use message::IntegrationMessage;
pub use outbox::{DrainResult, OutboxRelay, OutboxWriter};
pub use queue::{AckToken, QueueClient, QueueDepth, QueueEnvelope};
pub use redis_queue::{RedisQueue, RedisQueueConfig};
