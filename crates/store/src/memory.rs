use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use common::MessageId;
use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::RwLock;

use crate::{OutboxRecord, OutboxStore, Result, Store, StoreError};

const OUTBOX_PREFIX: &str = "outbox:";

fn outbox_key(message_id: MessageId) -> String {
    format!("{OUTBOX_PREFIX}{message_id}")
}

#[derive(Default)]
struct Inner {
    data: RwLock<BTreeMap<String, serde_json::Value>>,
    next_transaction: AtomicU64,
    open: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
    abandoned: AtomicU64,
    fail_begins: AtomicU32,
    fail_commits: AtomicU32,
    fail_rollbacks: AtomicU32,
}

/// Consumes one unit of an injected failure budget, returning true if a
/// failure should be produced.
fn take_failure(budget: &AtomicU32) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// In-memory key/value store with atomic transactions, for tests and
/// single-process use.
///
/// Transactions stage their writes privately; commit applies the whole
/// set under one write lock so readers never observe a partial commit.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Inner>,
}

impl InMemoryStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the committed value for a key.
    pub async fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.inner.data.read().await.get(key).cloned()
    }

    /// Returns the committed value for a key, deserialized.
    pub async fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Returns the number of committed keys.
    pub async fn len(&self) -> usize {
        self.inner.data.read().await.len()
    }

    /// Returns true if nothing has been committed.
    pub async fn is_empty(&self) -> bool {
        self.inner.data.read().await.is_empty()
    }

    /// Number of transactions currently open.
    pub fn open_transactions(&self) -> u64 {
        self.inner.open.load(Ordering::SeqCst)
    }

    /// Number of successful commits.
    pub fn commit_count(&self) -> u64 {
        self.inner.commits.load(Ordering::SeqCst)
    }

    /// Number of explicit rollbacks.
    pub fn rollback_count(&self) -> u64 {
        self.inner.rollbacks.load(Ordering::SeqCst)
    }

    /// Number of transactions dropped without commit or rollback.
    pub fn abandoned_count(&self) -> u64 {
        self.inner.abandoned.load(Ordering::SeqCst)
    }

    /// Makes the next `n` calls to `begin` fail with `Unavailable`.
    pub fn fail_next_begins(&self, n: u32) {
        self.inner.fail_begins.store(n, Ordering::SeqCst);
    }

    /// Makes the next `n` commits fail with `CommitRejected`.
    pub fn fail_next_commits(&self, n: u32) {
        self.inner.fail_commits.store(n, Ordering::SeqCst);
    }

    /// Makes the next `n` rollbacks fail with `Unavailable`.
    ///
    /// The staged writes are still discarded, as a real store does when the
    /// connection drops mid-rollback.
    pub fn fail_next_rollbacks(&self, n: u32) {
        self.inner.fail_rollbacks.store(n, Ordering::SeqCst);
    }

    /// Clears all committed data and counters.
    pub async fn clear(&self) {
        self.inner.data.write().await.clear();
        self.inner.commits.store(0, Ordering::SeqCst);
        self.inner.rollbacks.store(0, Ordering::SeqCst);
        self.inner.abandoned.store(0, Ordering::SeqCst);
    }
}

/// Transaction handle of [`InMemoryStore`].
///
/// Reads see the transaction's own staged writes first, then committed data.
pub struct InMemoryTransaction {
    id: u64,
    inner: Arc<Inner>,
    staged: BTreeMap<String, Option<serde_json::Value>>,
    finished: bool,
}

impl InMemoryTransaction {
    /// Returns the transaction id (unique per store).
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stages a write of a serializable value.
    pub fn put<T: Serialize>(&mut self, key: impl Into<String>, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.staged.insert(key.into(), Some(value));
        Ok(())
    }

    /// Stages a write of a raw JSON value.
    pub fn put_raw(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.staged.insert(key.into(), Some(value));
    }

    /// Stages a delete.
    pub fn delete(&mut self, key: impl Into<String>) {
        self.staged.insert(key.into(), None);
    }

    /// Reads a key as seen by this transaction.
    pub async fn get(&self, key: &str) -> Option<serde_json::Value> {
        if let Some(staged) = self.staged.get(key) {
            return staged.clone();
        }
        self.inner.data.read().await.get(key).cloned()
    }

    /// Reads and deserializes a key as seen by this transaction.
    pub async fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Number of staged writes.
    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    fn finish(&mut self) {
        self.finished = true;
        self.inner.open.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        if !self.finished {
            self.inner.open.fetch_sub(1, Ordering::SeqCst);
            self.inner.abandoned.fetch_add(1, Ordering::SeqCst);
            tracing::debug!(transaction = self.id, "transaction dropped without commit");
        }
    }
}

#[async_trait]
impl Store for InMemoryStore {
    type Transaction = InMemoryTransaction;

    async fn begin(&self) -> Result<InMemoryTransaction> {
        if take_failure(&self.inner.fail_begins) {
            return Err(StoreError::Unavailable("injected begin failure".to_string()));
        }

        let id = self.inner.next_transaction.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.open.fetch_add(1, Ordering::SeqCst);

        Ok(InMemoryTransaction {
            id,
            inner: Arc::clone(&self.inner),
            staged: BTreeMap::new(),
            finished: false,
        })
    }

    async fn commit(&self, mut transaction: InMemoryTransaction) -> Result<()> {
        if take_failure(&self.inner.fail_commits) {
            transaction.finish();
            return Err(StoreError::CommitRejected(format!(
                "injected commit failure for transaction {}",
                transaction.id
            )));
        }

        let staged = std::mem::take(&mut transaction.staged);
        {
            let mut data = self.inner.data.write().await;
            for (key, value) in staged {
                match value {
                    Some(value) => {
                        data.insert(key, value);
                    }
                    None => {
                        data.remove(&key);
                    }
                }
            }
        }

        transaction.finish();
        self.inner.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self, mut transaction: InMemoryTransaction) -> Result<()> {
        transaction.staged.clear();
        transaction.finish();
        if take_failure(&self.inner.fail_rollbacks) {
            return Err(StoreError::Unavailable(format!(
                "injected rollback failure for transaction {}",
                transaction.id
            )));
        }
        self.inner.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Outbox records live under `outbox:<message id>` keys.
#[async_trait]
impl OutboxStore for InMemoryStore {
    async fn stage_outbox(
        &self,
        transaction: &mut InMemoryTransaction,
        record: OutboxRecord,
    ) -> Result<()> {
        let key = outbox_key(record.message_id);
        if transaction.get(&key).await.is_some() {
            return Ok(());
        }
        transaction.put(key, &record)
    }

    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxRecord>> {
        let data = self.inner.data.read().await;
        let mut pending = data
            .range(OUTBOX_PREFIX.to_string()..)
            .take_while(|(key, _)| key.starts_with(OUTBOX_PREFIX))
            .map(|(_, value)| serde_json::from_value::<OutboxRecord>(value.clone()))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        drop(data);

        pending.sort_by_key(|record| (record.recorded_at, record.position));
        pending.truncate(limit);
        Ok(pending)
    }

    async fn mark_published(&self, message_id: MessageId) -> Result<()> {
        self.inner.data.write().await.remove(&outbox_key(message_id));
        Ok(())
    }
}
