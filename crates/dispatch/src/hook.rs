//! Writes that must land in the same transaction as the command.

use async_trait::async_trait;
use events::{BoxError, EventEnvelope};
use store::Store;

/// Runs after a handler succeeds and before its unit of work commits.
///
/// A hook sees the raised events and may add writes to the open
/// transaction, so they commit or roll back together with the command's
/// own writes. An error aborts the dispatch and rolls the unit of work back.
#[async_trait]
pub trait CommitHook<S: Store>: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    async fn before_commit(
        &self,
        store: &S,
        transaction: &mut S::Transaction,
        events: &[EventEnvelope],
    ) -> Result<(), BoxError>;
}
