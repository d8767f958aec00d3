use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::MessageId;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::{OutboxRecord, OutboxStore, Result, Store};

type OutboxRow = (Uuid, String, String, Vec<u8>, i64, DateTime<Utc>);

/// PostgreSQL-backed transactional store.
///
/// Handlers receive the `sqlx` transaction and run their own statements
/// against it (`&mut **tx`). Dropping an uncommitted transaction rolls it
/// back, which `sqlx` guarantees.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Creates a new PostgreSQL store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects a new pool to the given database URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPool::connect(url).await?;
        Ok(Self { pool })
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the `outbox_messages` table if it does not exist.
    pub async fn ensure_outbox_table(&self) -> Result<()> {
        sqlx::raw_sql(
            r#"
            CREATE TABLE IF NOT EXISTS outbox_messages (
                message_id UUID PRIMARY KEY,
                queue TEXT NOT NULL,
                message_type TEXT NOT NULL,
                payload BYTEA NOT NULL,
                position BIGINT NOT NULL,
                recorded_at TIMESTAMPTZ NOT NULL,
                published_at TIMESTAMPTZ
            );
            CREATE INDEX IF NOT EXISTS idx_outbox_messages_pending
                ON outbox_messages (recorded_at, position)
                WHERE published_at IS NULL;
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Store for PostgresStore {
    type Transaction = Transaction<'static, Postgres>;

    async fn begin(&self) -> Result<Self::Transaction> {
        Ok(self.pool.begin().await?)
    }

    async fn commit(&self, transaction: Self::Transaction) -> Result<()> {
        transaction.commit().await?;
        Ok(())
    }

    async fn rollback(&self, transaction: Self::Transaction) -> Result<()> {
        transaction.rollback().await?;
        Ok(())
    }
}

/// Records live in `outbox_messages`; see [`PostgresStore::ensure_outbox_table`].
///
/// A published row keeps its `published_at` stamp, so staging its id again
/// is a no-op.
#[async_trait]
impl OutboxStore for PostgresStore {
    async fn stage_outbox(
        &self,
        transaction: &mut Self::Transaction,
        record: OutboxRecord,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO outbox_messages (message_id, queue, message_type, payload, position, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (message_id) DO NOTHING
            "#,
        )
        .bind(record.message_id.as_uuid())
        .bind(&record.queue)
        .bind(&record.message_type)
        .bind(&record.payload)
        .bind(i64::try_from(record.position).unwrap_or(i64::MAX))
        .bind(record.recorded_at)
        .execute(&mut **transaction)
        .await?;
        Ok(())
    }

    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxRecord>> {
        let rows: Vec<OutboxRow> = sqlx::query_as(
            r#"
            SELECT message_id, queue, message_type, payload, position, recorded_at
            FROM outbox_messages
            WHERE published_at IS NULL
            ORDER BY recorded_at ASC, position ASC
            LIMIT $1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(message_id, queue, message_type, payload, position, recorded_at)| OutboxRecord {
                    message_id: MessageId::from_uuid(message_id),
                    queue,
                    message_type,
                    payload,
                    position: u64::try_from(position).unwrap_or_default(),
                    recorded_at,
                },
            )
            .collect())
    }

    async fn mark_published(&self, message_id: MessageId) -> Result<()> {
        sqlx::query(
            "UPDATE outbox_messages SET published_at = now() WHERE message_id = $1 AND published_at IS NULL",
        )
        .bind(message_id.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
