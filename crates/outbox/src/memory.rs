use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{MessageId, SagaId};
use tokio::sync::RwLock;

use crate::message::{NewOutboxMessage, OutboxMessage, OutboxStatus};
use crate::store::OutboxStore;
use crate::{OutboxError, Result};

/// In-memory outbox store for tests and single-process deployments.
///
/// Provides the same interface as the PostgreSQL implementation. Each call
/// is atomic with respect to the shared state.
#[derive(Clone, Default)]
pub struct InMemoryOutboxStore {
    rows: Arc<RwLock<HashMap<MessageId, OutboxMessage>>>,
}

impl InMemoryOutboxStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of rows, regardless of status.
    pub async fn row_count(&self) -> usize {
        self.rows.read().await.len()
    }

    /// Clears all rows.
    pub async fn clear(&self) {
        self.rows.write().await.clear();
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn enqueue(&self, message: NewOutboxMessage) -> Result<OutboxMessage> {
        let row = OutboxMessage::from_new(message);
        self.rows.write().await.insert(row.id, row.clone());
        Ok(row)
    }

    async fn enqueue_all(&self, messages: Vec<NewOutboxMessage>) -> Result<Vec<OutboxMessage>> {
        let mut rows = self.rows.write().await;
        let mut inserted = Vec::with_capacity(messages.len());
        for message in messages {
            let row = OutboxMessage::from_new(message);
            rows.insert(row.id, row.clone());
            inserted.push(row);
        }
        Ok(inserted)
    }

    async fn fetch_batch(&self, limit: usize, max_retries: u32) -> Result<Vec<OutboxMessage>> {
        let rows = self.rows.read().await;
        let mut eligible: Vec<_> = rows
            .values()
            .filter(|m| m.status == OutboxStatus::Pending && m.retry_count < max_retries)
            .cloned()
            .collect();
        eligible.sort_by_key(|m| m.created_at);
        eligible.truncate(limit);
        Ok(eligible)
    }

    async fn mark_processing(&self, id: MessageId) -> Result<()> {
        let mut rows = self.rows.write().await;
        let row = rows.get_mut(&id).ok_or(OutboxError::MessageNotFound(id))?;
        if row.status != OutboxStatus::Pending {
            return Err(OutboxError::InvalidStatus {
                id,
                expected: "Pending",
                actual: row.status.to_string(),
            });
        }
        row.status = OutboxStatus::Processing;
        Ok(())
    }

    async fn mark_completed(&self, id: MessageId) -> Result<()> {
        let mut rows = self.rows.write().await;
        let row = rows.get_mut(&id).ok_or(OutboxError::MessageNotFound(id))?;
        row.status = OutboxStatus::Completed;
        row.processed_at = Some(Utc::now());
        Ok(())
    }

    async fn recover_processing(&self) -> Result<u64> {
        let mut rows = self.rows.write().await;
        let mut requeued = 0;
        for row in rows.values_mut() {
            if row.status == OutboxStatus::Processing {
                row.status = OutboxStatus::Pending;
                requeued += 1;
            }
        }
        Ok(requeued)
    }

    async fn record_failure(&self, id: MessageId, error: &str, max_retries: u32) -> Result<()> {
        let mut rows = self.rows.write().await;
        let row = rows.get_mut(&id).ok_or(OutboxError::MessageNotFound(id))?;
        row.retry_count += 1;
        row.error_message = Some(error.to_string());
        if row.retry_count >= max_retries {
            row.status = OutboxStatus::Failed;
            row.processed_at = Some(Utc::now());
        } else {
            row.status = OutboxStatus::Pending;
        }
        Ok(())
    }

    async fn purge_terminal(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut rows = self.rows.write().await;
        let before = rows.len();
        rows.retain(|_, m| {
            let stamp = m.processed_at.unwrap_or(m.created_at);
            !(m.status.is_terminal() && stamp < older_than)
        });
        Ok((before - rows.len()) as u64)
    }

    async fn get(&self, id: MessageId) -> Result<Option<OutboxMessage>> {
        Ok(self.rows.read().await.get(&id).cloned())
    }

    async fn messages_for_saga(&self, saga_id: SagaId) -> Result<Vec<OutboxMessage>> {
        let rows = self.rows.read().await;
        let mut matched: Vec<_> = rows
            .values()
            .filter(|m| m.saga_id == Some(saga_id))
            .cloned()
            .collect();
        matched.sort_by_key(|m| m.created_at);
        Ok(matched)
    }
}
