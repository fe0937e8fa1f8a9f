use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{SagaId, StepId};

use crate::record::{Saga, SagaStep, StepStatus};
use crate::Result;

/// Durable store of saga instances and their step records.
///
/// Step records are append-only per saga; only `status` and `completed_at`
/// change after insertion. All implementations must be thread-safe
/// (Send + Sync).
#[async_trait]
pub trait SagaStore: Send + Sync {
    /// Persists a new saga.
    async fn insert_saga(&self, saga: &Saga) -> Result<()>;

    /// Overwrites a saga's mutable fields (status, timestamps, last error).
    async fn update_saga(&self, saga: &Saga) -> Result<()>;

    /// Fetches a saga by id.
    async fn get_saga(&self, saga_id: SagaId) -> Result<Option<Saga>>;

    /// Appends a step record.
    async fn insert_step(&self, step: &SagaStep) -> Result<()>;

    /// Updates a step record's status and completion stamp.
    async fn update_step(&self, step: &SagaStep) -> Result<()>;

    /// Fetches a step record by id.
    async fn get_step(&self, step_id: StepId) -> Result<Option<SagaStep>>;

    /// All step records for a saga, oldest first.
    async fn steps_for_saga(&self, saga_id: SagaId) -> Result<Vec<SagaStep>>;

    /// Completed forward steps for a saga, newest first.
    ///
    /// This is the undo order: compensation is issued most-recent-first.
    async fn completed_steps_desc(&self, saga_id: SagaId) -> Result<Vec<SagaStep>>;

    /// Finds the compensation record (if any) that references a forward
    /// step. Used as the idempotency existence check on the consume path.
    async fn find_compensation_record(
        &self,
        compensation_step_id: StepId,
    ) -> Result<Option<SagaStep>>;

    /// Non-terminal sagas whose `updated_at` is older than the cutoff.
    /// Detection only; the sweep never resolves them.
    async fn find_stalled(&self, cutoff: DateTime<Utc>) -> Result<Vec<Saga>>;
}

/// Extension helpers shared by all store implementations.
#[async_trait]
pub trait SagaStoreExt: SagaStore {
    /// The set of step names with at least one `Completed` record.
    async fn completed_step_names(&self, saga_id: SagaId) -> Result<Vec<String>> {
        let steps = self.steps_for_saga(saga_id).await?;
        let mut names: Vec<String> = steps
            .into_iter()
            .filter(|s| !s.is_compensation() && s.status == StepStatus::Completed)
            .map(|s| s.step_name)
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// True when every compensation record for the saga has settled
    /// `Compensated`. Vacuously true when there are none, so a saga with
    /// nothing to undo finalizes immediately.
    async fn compensation_settled(&self, saga_id: SagaId) -> Result<bool> {
        let steps = self.steps_for_saga(saga_id).await?;
        Ok(steps
            .iter()
            .filter(|s| s.is_compensation())
            .all(|s| s.status == StepStatus::Compensated))
    }
}

impl<T: SagaStore + ?Sized> SagaStoreExt for T {}
