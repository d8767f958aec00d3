use common::MessageId;
use store::StoreError;
use thiserror::Error;

/// Errors raised by the broker, queue clients and consumer loop.
#[derive(Error, Debug)]
pub enum MessagingError {
    /// The queue backend could not be reached.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The outbox store failed.
    #[error("Outbox store error: {0}")]
    Store(#[from] StoreError),

    /// A queue payload could not be decoded into a message.
    #[error("Undecodable message {message_id}: {reason}")]
    Undecodable {
        message_id: MessageId,
        reason: String,
    },

    /// The acknowledgement token no longer owns the message: its visibility
    /// expired and another consumer received it.
    #[error("Stale ack token for message {0}")]
    StaleAckToken(MessageId),

    /// The message is not currently leased with this token.
    #[error("Message {0} is not in flight")]
    NotInFlight(MessageId),

    /// Every publish attempt failed.
    #[error("Publishing {message_id} to '{queue}' failed after {attempts} attempts: {source}")]
    PublishExhausted {
        message_id: MessageId,
        queue: String,
        attempts: u32,
        #[source]
        source: Box<MessagingError>,
    },

    /// The message exceeded its delivery budget.
    #[error("Message {message_id} failed {delivery_count} deliveries")]
    PoisonMessage {
        message_id: MessageId,
        delivery_count: u32,
    },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl MessagingError {
    /// Returns true for failures worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            MessagingError::Transport(_) => true,
            MessagingError::Redis(error) => {
                error.is_io_error()
                    || error.is_connection_dropped()
                    || error.is_connection_refusal()
                    || error.is_timeout()
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, MessagingError>;
