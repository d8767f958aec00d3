//! Outbox records: integration messages committed with the command that
//! raised them, published later.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::MessageId;
use serde::{Deserialize, Serialize};

use crate::{Result, Store};

/// An encoded integration message waiting to be pushed to its queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub message_id: MessageId,
    pub queue: String,
    pub message_type: String,
    /// The message exactly as it goes on the wire.
    pub payload: Vec<u8>,
    /// Raise order within the unit of work that staged the record.
    pub position: u64,
    pub recorded_at: DateTime<Utc>,
}

/// A store that keeps an outbox next to its own data.
///
/// Records staged in a transaction become pending when it commits and are
/// discarded with it on rollback. Pending records come back oldest first,
/// ties broken by position, until marked published.
#[async_trait]
pub trait OutboxStore: Store {
    /// Adds a record to the open transaction. Staging an id that is already
    /// pending keeps the existing record.
    async fn stage_outbox(
        &self,
        transaction: &mut Self::Transaction,
        record: OutboxRecord,
    ) -> Result<()>;

    /// Returns up to `limit` committed records not yet published.
    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxRecord>>;

    /// Removes a record from the pending set. Unknown ids are ignored.
    async fn mark_published(&self, message_id: MessageId) -> Result<()>;
}
