use messaging::MessagingError;
use store::StoreError;
use thiserror::Error;

/// Invalid relay configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid {key}={value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Errors that stop the relay from starting.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Queue backend error: {0}")]
    Messaging(#[from] MessagingError),

    #[error("Outbox store error: {0}")]
    Store(#[from] StoreError),

    #[error("Metrics exporter error: {0}")]
    Metrics(String),

    #[error("Worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

/// Result type for relay start-up.
pub type Result<T> = std::result::Result<T, RelayError>;
