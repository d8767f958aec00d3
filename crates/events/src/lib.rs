//! Domain events and their in-process fan-out.
//!
//! This crate provides:
//! - [`DomainEvent`] trait for typed events and [`EventEnvelope`], the form
//!   events travel in once raised
//! - [`EventSubscriber`] trait for reactions to events
//! - [`EventDispatcher`] for synchronous fan-out with isolated failures
//! - [`Deduplicate`] for subscribers that must tolerate redelivery

pub mod dedup;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod subscriber;

pub use common::{ActorId, EventId, MessageId};
pub use dedup::Deduplicate;
pub use dispatcher::{DeliveryReport, EventDispatcher, EventDispatcherBuilder};
pub use error::{BoxError, EventDeliveryError};
pub use event::{DomainEvent, EventEnvelope, EventEnvelopeBuilder};
pub use subscriber::EventSubscriber;
