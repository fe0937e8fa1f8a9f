use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{MessageId, SagaId};

use crate::message::{NewOutboxMessage, OutboxMessage};
use crate::Result;

/// Durable store of outbound messages.
///
/// Every write path that is causally linked to a local business change must
/// insert its outbox row in the same local transaction as that change; the
/// Postgres adapter exposes [`enqueue_in`](crate::PostgresOutboxStore::enqueue_in)
/// for exactly that. All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Inserts a pending row.
    async fn enqueue(&self, message: NewOutboxMessage) -> Result<OutboxMessage>;

    /// Inserts a batch of pending rows atomically, preserving order.
    async fn enqueue_all(&self, messages: Vec<NewOutboxMessage>) -> Result<Vec<OutboxMessage>>;

    /// Returns rows eligible for a publish attempt, oldest first.
    ///
    /// Eligible means `status = Pending` with `retry_count < max_retries`.
    /// `Failed` rows are terminal and never returned.
    async fn fetch_batch(&self, limit: usize, max_retries: u32) -> Result<Vec<OutboxMessage>>;

    /// Transitions a pending row to `Processing`.
    async fn mark_processing(&self, id: MessageId) -> Result<()>;

    /// Transitions a row to `Completed` and stamps `processed_at`.
    async fn mark_completed(&self, id: MessageId) -> Result<()>;

    /// Returns `Processing` rows to `Pending`. Returns the number of rows
    /// requeued.
    ///
    /// Recovery for rows stranded when the publisher crashed between
    /// pickup and the publish outcome. Safe only because a single
    /// publisher works the table and its ticks never overlap, so any
    /// `Processing` row observed outside a tick is an orphan; the
    /// publisher calls this once on startup, before its first poll.
    async fn recover_processing(&self) -> Result<u64>;

    /// Records a failed publish attempt.
    ///
    /// Increments `retry_count` and stores the error message. The row
    /// returns to `Pending` while budget remains; once `retry_count`
    /// reaches `max_retries` it becomes terminal `Failed` and stamps
    /// `processed_at`.
    async fn record_failure(&self, id: MessageId, error: &str, max_retries: u32) -> Result<()>;

    /// Deletes terminal rows older than the cutoff. Returns the number of
    /// rows removed.
    async fn purge_terminal(&self, older_than: DateTime<Utc>) -> Result<u64>;

    /// Fetches a single row.
    async fn get(&self, id: MessageId) -> Result<Option<OutboxMessage>>;

    /// Returns all rows correlated with a saga, oldest first.
    async fn messages_for_saga(&self, saga_id: SagaId) -> Result<Vec<OutboxMessage>>;
}
