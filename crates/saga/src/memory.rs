use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{SagaId, StepId};
use outbox::{InMemoryOutboxStore, NewOutboxMessage, OutboxMessage, OutboxStore};
use tokio::sync::RwLock;

use crate::compensation::CompensationLog;
use crate::record::{Saga, SagaStep, StepStatus};
use crate::store::SagaStore;
use crate::{Result, SagaError};

#[derive(Default)]
struct MemoryState {
    sagas: HashMap<SagaId, Saga>,
    steps: Vec<SagaStep>,
}

/// In-memory saga store for tests and single-process deployments.
///
/// Provides the same interface as the PostgreSQL implementation.
#[derive(Clone, Default)]
pub struct InMemorySagaStore {
    state: Arc<RwLock<MemoryState>>,
}

impl InMemorySagaStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of saga instances.
    pub async fn saga_count(&self) -> usize {
        self.state.read().await.sagas.len()
    }

    /// Total number of step records across all sagas.
    pub async fn step_count(&self) -> usize {
        self.state.read().await.steps.len()
    }
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    async fn insert_saga(&self, saga: &Saga) -> Result<()> {
        self.state.write().await.sagas.insert(saga.id, saga.clone());
        Ok(())
    }

    async fn update_saga(&self, saga: &Saga) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.sagas.contains_key(&saga.id) {
            return Err(SagaError::SagaNotFound(saga.id));
        }
        state.sagas.insert(saga.id, saga.clone());
        Ok(())
    }

    async fn get_saga(&self, saga_id: SagaId) -> Result<Option<Saga>> {
        Ok(self.state.read().await.sagas.get(&saga_id).cloned())
    }

    async fn insert_step(&self, step: &SagaStep) -> Result<()> {
        self.state.write().await.steps.push(step.clone());
        Ok(())
    }

    async fn update_step(&self, step: &SagaStep) -> Result<()> {
        let mut state = self.state.write().await;
        let existing = state
            .steps
            .iter_mut()
            .find(|s| s.id == step.id)
            .ok_or(SagaError::StepNotFound(step.id))?;
        if existing.status != step.status && !existing.status.can_transition_to(step.status) {
            return Err(SagaError::InvalidStepTransition {
                step_id: step.id,
                from: existing.status,
                to: step.status,
            });
        }
        existing.status = step.status;
        existing.completed_at = step.completed_at;
        Ok(())
    }

    async fn get_step(&self, step_id: StepId) -> Result<Option<SagaStep>> {
        Ok(self
            .state
            .read()
            .await
            .steps
            .iter()
            .find(|s| s.id == step_id)
            .cloned())
    }

    async fn steps_for_saga(&self, saga_id: SagaId) -> Result<Vec<SagaStep>> {
        let state = self.state.read().await;
        let mut steps: Vec<_> = state
            .steps
            .iter()
            .filter(|s| s.saga_id == saga_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.created_at);
        Ok(steps)
    }

    async fn completed_steps_desc(&self, saga_id: SagaId) -> Result<Vec<SagaStep>> {
        let state = self.state.read().await;
        let mut steps: Vec<_> = state
            .steps
            .iter()
            .filter(|s| {
                s.saga_id == saga_id
                    && !s.is_compensation()
                    && s.status == StepStatus::Completed
            })
            .cloned()
            .collect();
        steps.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(steps)
    }

    async fn find_compensation_record(
        &self,
        compensation_step_id: StepId,
    ) -> Result<Option<SagaStep>> {
        Ok(self
            .state
            .read()
            .await
            .steps
            .iter()
            .find(|s| s.compensation_step_id == Some(compensation_step_id))
            .cloned())
    }

    async fn find_stalled(&self, cutoff: DateTime<Utc>) -> Result<Vec<Saga>> {
        let state = self.state.read().await;
        let mut stalled: Vec<_> = state
            .sagas
            .values()
            .filter(|s| !s.status.is_terminal() && s.updated_at < cutoff)
            .cloned()
            .collect();
        stalled.sort_by_key(|s| s.updated_at);
        Ok(stalled)
    }
}

/// Compensation log over the in-memory stores.
///
/// The two writes are sequential rather than a shared transaction; the
/// in-process stores have no crash window between them.
#[derive(Clone)]
pub struct InMemoryCompensationLog {
    store: InMemorySagaStore,
    outbox: InMemoryOutboxStore,
}

impl InMemoryCompensationLog {
    /// Creates a log writing through the given store handles.
    pub fn new(store: InMemorySagaStore, outbox: InMemoryOutboxStore) -> Self {
        Self { store, outbox }
    }
}

#[async_trait]
impl CompensationLog for InMemoryCompensationLog {
    async fn append(&self, record: &SagaStep, message: NewOutboxMessage) -> Result<OutboxMessage> {
        let row = self.outbox.enqueue(message).await?;
        self.store.insert_step(record).await?;
        Ok(row)
    }
}
