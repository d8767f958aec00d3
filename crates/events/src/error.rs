//! Event delivery error types.

use thiserror::Error;

/// Error type returned by subscriber and handler code.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A single subscriber failed to process an event.
///
/// Delivery errors are non-fatal: they are collected in a
/// [`DeliveryReport`](crate::DeliveryReport) and never stop other
/// subscribers or later events.
#[derive(Debug, Error)]
pub enum EventDeliveryError {
    /// The subscriber returned an error.
    #[error("Subscriber '{subscriber}' failed on {event_type} ({event_id}): {source}")]
    Failed {
        subscriber: String,
        event_type: String,
        event_id: common::EventId,
        #[source]
        source: BoxError,
    },

    /// The subscriber panicked.
    #[error("Subscriber '{subscriber}' panicked on {event_type} ({event_id}): {message}")]
    Panicked {
        subscriber: String,
        event_type: String,
        event_id: common::EventId,
        message: String,
    },
}

impl EventDeliveryError {
    /// Returns the name of the failing subscriber.
    pub fn subscriber(&self) -> &str {
        match self {
            EventDeliveryError::Failed { subscriber, .. }
            | EventDeliveryError::Panicked { subscriber, .. } => subscriber,
        }
    }

    /// Returns the type of the event that could not be delivered.
    pub fn event_type(&self) -> &str {
        match self {
            EventDeliveryError::Failed { event_type, .. }
            | EventDeliveryError::Panicked { event_type, .. } => event_type,
        }
    }
}
