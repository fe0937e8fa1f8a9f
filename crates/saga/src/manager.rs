//! The orchestration brain: starts sagas, records step outcomes, decides
//! completion, and triggers compensation.

use common::{Payload, SagaId};

use crate::compensation::{CompensationDispatcher, CompensationLog, CompensationRegistry};
use crate::definitions::SagaDefinitions;
use crate::record::{Saga, SagaStatus, SagaStep, StepStatus};
use crate::store::{SagaStore, SagaStoreExt};
use crate::{Result, SagaError};

/// Orchestrates saga instances over a saga store and a compensation log.
///
/// Operations run synchronously within the caller's request context and
/// never spawn background work; all asynchronous follow-up (compensation
/// execution, event consumption) happens through the event bus. Storage
/// errors propagate uncaught; retries belong to the outer business
/// transaction.
pub struct SagaManager<S: SagaStore, L: CompensationLog> {
    store: S,
    log: L,
    definitions: SagaDefinitions,
    dispatcher: CompensationDispatcher,
}

impl<S: SagaStore, L: CompensationLog> SagaManager<S, L> {
    /// Creates a manager with its step-list configuration and compensation
    /// handler registry. Both are injected here; there is no global state.
    pub fn new(
        store: S,
        log: L,
        definitions: SagaDefinitions,
        registry: CompensationRegistry,
    ) -> Self {
        Self {
            store,
            log,
            definitions,
            dispatcher: CompensationDispatcher::new(registry),
        }
    }

    /// Creates and persists a new saga in `Started`.
    #[tracing::instrument(skip(self, payload))]
    pub async fn start_saga(&self, saga_type: &str, payload: Payload) -> Result<Saga> {
        let saga = Saga::new(saga_type, payload);
        self.store.insert_saga(&saga).await?;

        metrics::counter!("saga_started_total").increment(1);
        tracing::info!(saga_id = %saga.id, saga_type, "saga started");
        Ok(saga)
    }

    /// Appends a step record and applies its status side effects.
    ///
    /// - `Failed` moves the saga into compensation: prior completed steps
    ///   are dispatched to the outbox synchronously, newest first.
    /// - `Completed` checks whether the set of completed step names now
    ///   covers the registered list for the saga's type; the check is
    ///   idempotent and order-independent, so steps may be recorded out of
    ///   order from parallel sub-operations.
    /// - `PartiallyCompleted` marks the saga terminal with mixed results.
    /// - `Started` is informational.
    #[tracing::instrument(skip(self, payload), fields(saga_id = %saga_id))]
    pub async fn record_step(
        &self,
        saga_id: SagaId,
        step_name: &str,
        status: StepStatus,
        payload: Option<Payload>,
    ) -> Result<SagaStep> {
        let mut saga = self
            .store
            .get_saga(saga_id)
            .await?
            .ok_or(SagaError::SagaNotFound(saga_id))?;

        let step = SagaStep::forward(saga_id, step_name, status, payload);
        self.store.insert_step(&step).await?;

        match status {
            StepStatus::Failed => {
                let error = step
                    .payload
                    .as_ref()
                    .and_then(|p| p.get_str("error"))
                    .map(String::from)
                    .unwrap_or_else(|| format!("step '{step_name}' failed"));
                self.compensate(&mut saga, error).await?;
            }
            StepStatus::Completed => {
                saga.touch();
                self.store.update_saga(&saga).await?;

                // A duplicate or late completion arriving after the saga
                // settled is recorded but changes nothing.
                if saga.status == SagaStatus::Started {
                    let completed = self.store.completed_step_names(saga_id).await?;
                    if self
                        .definitions
                        .all_steps_completed(&saga.saga_type, &completed)
                    {
                        self.checked_transition(&mut saga, SagaStatus::Completed)?;
                        self.store.update_saga(&saga).await?;
                        metrics::counter!("saga_completed_total").increment(1);
                        tracing::info!(saga_id = %saga.id, "saga completed");
                    }
                }
            }
            StepStatus::PartiallyCompleted => {
                self.checked_transition(&mut saga, SagaStatus::PartiallyCompleted)?;
                self.store.update_saga(&saga).await?;
                tracing::info!(saga_id = %saga.id, "saga partially completed");
            }
            _ => {
                saga.touch();
                self.store.update_saga(&saga).await?;
            }
        }

        Ok(step)
    }

    /// Explicit terminal completion, for callers that determine completion
    /// out-of-band rather than via the all-steps-completed check.
    #[tracing::instrument(skip(self))]
    pub async fn complete_saga(&self, saga_id: SagaId) -> Result<Saga> {
        let mut saga = self
            .store
            .get_saga(saga_id)
            .await?
            .ok_or(SagaError::SagaNotFound(saga_id))?;

        self.checked_transition(&mut saga, SagaStatus::Completed)?;
        self.store.update_saga(&saga).await?;

        metrics::counter!("saga_completed_total").increment(1);
        tracing::info!(saga_id = %saga.id, "saga completed explicitly");
        Ok(saga)
    }

    /// Explicit failure signal; always triggers compensation.
    #[tracing::instrument(skip(self))]
    pub async fn fail_saga(&self, saga_id: SagaId, error: &str) -> Result<Saga> {
        let mut saga = self
            .store
            .get_saga(saga_id)
            .await?
            .ok_or(SagaError::SagaNotFound(saga_id))?;

        self.checked_transition(&mut saga, SagaStatus::Failed)?;
        saga.last_error = Some(error.to_string());
        self.store.update_saga(&saga).await?;

        self.compensate(&mut saga, error.to_string()).await?;
        Ok(saga)
    }

    /// Fetches a saga.
    pub async fn get_saga(&self, saga_id: SagaId) -> Result<Option<Saga>> {
        self.store.get_saga(saga_id).await
    }

    /// All step records for a saga, oldest first.
    pub async fn steps(&self, saga_id: SagaId) -> Result<Vec<SagaStep>> {
        self.store.steps_for_saga(saga_id).await
    }

    /// Moves the saga into `Compensating` and issues the undo plan.
    ///
    /// The saga stays `Compensating` until every compensation record has
    /// settled; the consumer performs that finalization as undo outcomes
    /// arrive. Only when there is nothing to undo (no completed steps, or
    /// every record already settled) does the saga land in `Compensated`
    /// here.
    async fn compensate(&self, saga: &mut Saga, error: String) -> Result<()> {
        saga.last_error = Some(error);
        if saga.status != SagaStatus::Compensating {
            self.checked_transition(saga, SagaStatus::Compensating)?;
        }
        self.store.update_saga(saga).await?;

        metrics::counter!("saga_compensating_total").increment(1);
        let dispatched = self
            .dispatcher
            .dispatch(saga, &self.store, &self.log)
            .await?;

        if self.store.compensation_settled(saga.id).await? {
            self.checked_transition(saga, SagaStatus::Compensated)?;
            self.store.update_saga(saga).await?;
        }

        tracing::warn!(
            saga_id = %saga.id,
            dispatched,
            error = saga.last_error.as_deref().unwrap_or(""),
            "saga compensation dispatched"
        );
        Ok(())
    }

    fn checked_transition(&self, saga: &mut Saga, to: SagaStatus) -> Result<()> {
        if !saga.status.can_transition_to(to) {
            return Err(SagaError::InvalidTransition {
                saga_id: saga.id,
                from: saga.status,
                to,
            });
        }
        saga.transition(to);
        Ok(())
    }
}
