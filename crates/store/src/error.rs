use thiserror::Error;

/// Errors that can occur when interacting with the transactional store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The store refused to commit; no writes of the transaction were applied.
    #[error("Commit rejected: {0}")]
    CommitRejected(String),

    /// The store could not be reached or refused to open a transaction.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The task driving a commit or rollback ended before reporting a result.
    #[error("Transaction task interrupted: {0}")]
    Interrupted(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
