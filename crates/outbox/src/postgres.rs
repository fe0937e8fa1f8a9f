use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{EventId, MessageId, Payload, SagaId};
use sqlx::{postgres::PgRow, PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::message::{NewOutboxMessage, OutboxMessage, OutboxStatus};
use crate::store::OutboxStore;
use crate::{OutboxError, Result};

/// PostgreSQL-backed outbox store.
#[derive(Clone)]
pub struct PostgresOutboxStore {
    pool: PgPool,
}

impl PostgresOutboxStore {
    /// Creates a new PostgreSQL outbox store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Inserts a pending row inside a caller-owned transaction.
    ///
    /// This is the core of the outbox pattern: the business write and the
    /// outbox row commit together or not at all, so the notification is
    /// never lost relative to the state it describes.
    pub async fn enqueue_in(
        tx: &mut Transaction<'_, Postgres>,
        message: NewOutboxMessage,
    ) -> Result<OutboxMessage> {
        let row = OutboxMessage::from_new(message);
        Self::insert(&mut **tx, &row).await?;
        Ok(row)
    }

    async fn insert<'e, E>(executor: E, row: &OutboxMessage) -> Result<()>
    where
        E: sqlx::PgExecutor<'e>,
    {
        sqlx::query(
            r#"
            INSERT INTO outbox_messages
                (id, event_id, topic, key, payload, status, retry_count, error_message, created_at, processed_at, saga_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(row.id.as_uuid())
        .bind(row.event_id.as_uuid())
        .bind(&row.topic)
        .bind(&row.key)
        .bind(row.payload.to_json())
        .bind(row.status.as_str())
        .bind(row.retry_count as i32)
        .bind(&row.error_message)
        .bind(row.created_at)
        .bind(row.processed_at)
        .bind(row.saga_id.map(|id| id.as_uuid()))
        .execute(executor)
        .await?;
        Ok(())
    }

    fn row_to_message(row: PgRow) -> Result<OutboxMessage> {
        let status_text: String = row.try_get("status")?;
        let status = OutboxStatus::parse(&status_text).ok_or_else(|| {
            OutboxError::Serialization(serde_json::Error::io(std::io::Error::other(format!(
                "unknown outbox status: {status_text}"
            ))))
        })?;

        Ok(OutboxMessage {
            id: MessageId::from_uuid(row.try_get::<Uuid, _>("id")?),
            event_id: EventId::from_uuid(row.try_get::<Uuid, _>("event_id")?),
            topic: row.try_get("topic")?,
            key: row.try_get("key")?,
            payload: Payload::from_json(row.try_get("payload")?),
            status,
            retry_count: row.try_get::<i32, _>("retry_count")? as u32,
            error_message: row.try_get("error_message")?,
            created_at: row.try_get("created_at")?,
            processed_at: row.try_get("processed_at")?,
            saga_id: row
                .try_get::<Option<Uuid>, _>("saga_id")?
                .map(SagaId::from_uuid),
        })
    }

    async fn get_status(&self, id: MessageId) -> Result<Option<String>> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM outbox_messages WHERE id = $1")
                .bind(id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;
        Ok(status)
    }
}

const SELECT_COLUMNS: &str = "id, event_id, topic, key, payload, status, retry_count, \
                              error_message, created_at, processed_at, saga_id";

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    async fn enqueue(&self, message: NewOutboxMessage) -> Result<OutboxMessage> {
        let row = OutboxMessage::from_new(message);
        Self::insert(&self.pool, &row).await?;
        Ok(row)
    }

    async fn enqueue_all(&self, messages: Vec<NewOutboxMessage>) -> Result<Vec<OutboxMessage>> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = Vec::with_capacity(messages.len());
        for message in messages {
            let row = OutboxMessage::from_new(message);
            Self::insert(&mut *tx, &row).await?;
            inserted.push(row);
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn fetch_batch(&self, limit: usize, max_retries: u32) -> Result<Vec<OutboxMessage>> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM outbox_messages \
             WHERE status = 'Pending' AND retry_count < $1 \
             ORDER BY created_at ASC LIMIT $2"
        ))
        .bind(max_retries as i32)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_message).collect()
    }

    async fn mark_processing(&self, id: MessageId) -> Result<()> {
        let result = sqlx::query(
            "UPDATE outbox_messages SET status = 'Processing' WHERE id = $1 AND status = 'Pending'",
        )
        .bind(id.as_uuid())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return match self.get_status(id).await? {
                Some(actual) => Err(OutboxError::InvalidStatus {
                    id,
                    expected: "Pending",
                    actual,
                }),
                None => Err(OutboxError::MessageNotFound(id)),
            };
        }
        Ok(())
    }

    async fn mark_completed(&self, id: MessageId) -> Result<()> {
        let result = sqlx::query(
            "UPDATE outbox_messages SET status = 'Completed', processed_at = $2 WHERE id = $1",
        )
        .bind(id.as_uuid())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(OutboxError::MessageNotFound(id));
        }
        Ok(())
    }

    async fn recover_processing(&self) -> Result<u64> {
        let result =
            sqlx::query("UPDATE outbox_messages SET status = 'Pending' WHERE status = 'Processing'")
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    async fn record_failure(&self, id: MessageId, error: &str, max_retries: u32) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET retry_count = retry_count + 1,
                error_message = $2,
                status = CASE WHEN retry_count + 1 >= $3 THEN 'Failed' ELSE 'Pending' END,
                processed_at = CASE WHEN retry_count + 1 >= $3 THEN $4 ELSE processed_at END
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(error)
        .bind(max_retries as i32)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(OutboxError::MessageNotFound(id));
        }
        Ok(())
    }

    async fn purge_terminal(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM outbox_messages \
             WHERE status IN ('Completed', 'Failed') \
             AND COALESCE(processed_at, created_at) < $1",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn get(&self, id: MessageId) -> Result<Option<OutboxMessage>> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM outbox_messages WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_message).transpose()
    }

    async fn messages_for_saga(&self, saga_id: SagaId) -> Result<Vec<OutboxMessage>> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM outbox_messages \
             WHERE saga_id = $1 ORDER BY created_at ASC"
        ))
        .bind(saga_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_message).collect()
    }
}
