use async_trait::async_trait;

use crate::Result;

/// Core trait for transactional stores.
///
/// The transaction handle is opaque to the dispatch layer: it is created by
/// `begin`, lent to command handlers through the unit of work and finally
/// consumed by exactly one of `commit` or `rollback`.
///
/// Implementations must guarantee that a failed `commit` leaves no effects,
/// and that a transaction dropped without either call is discarded.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// The transaction handle type.
    type Transaction: Send + 'static;

    /// Opens a new transaction.
    async fn begin(&self) -> Result<Self::Transaction>;

    /// Atomically makes every write of the transaction durable.
    async fn commit(&self, transaction: Self::Transaction) -> Result<()>;

    /// Discards every write of the transaction.
    async fn rollback(&self, transaction: Self::Transaction) -> Result<()>;
}
