//! Compensation consumer: executes undo actions received from the bus.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use common::{Payload, SagaId};
use outbox::BusMessage;
use tokio::sync::broadcast;

use crate::compensation::{CompensationCommand, COMPENSATION_TOPIC};
use crate::record::{SagaStatus, SagaStep, StepStatus};
use crate::store::{SagaStore, SagaStoreExt};
use crate::Result;

/// Result of applying an undo routine.
///
/// Explicit outcome values replace exception-driven "already compensated"
/// checks: a duplicate delivery reports `AlreadyApplied` instead of
/// failing on a missing row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndoOutcome {
    /// The undo changed local state.
    Applied,

    /// Local state already reflected the undo (duplicate delivery).
    AlreadyApplied,
}

/// An undo routine for one compensation action tag.
///
/// Routines must be idempotent: re-applying the same compensation under
/// at-least-once delivery must be a no-op on the second application
/// (check before delete, check before re-create).
#[async_trait]
pub trait UndoAction: Send + Sync {
    /// Applies the undo described by `data`.
    async fn undo(&self, data: &Payload) -> Result<UndoOutcome>;
}

/// Registry mapping compensation action tags to undo routines.
#[derive(Default)]
pub struct UndoRegistry {
    actions: HashMap<String, Box<dyn UndoAction>>,
}

impl UndoRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an undo routine for an action tag, builder style.
    pub fn register(
        mut self,
        action: impl Into<String>,
        routine: impl UndoAction + 'static,
    ) -> Self {
        self.actions.insert(action.into(), Box::new(routine));
        self
    }

    /// Looks up the routine for an action tag.
    pub fn get(&self, action: &str) -> Option<&dyn UndoAction> {
        self.actions.get(action).map(Box::as_ref)
    }
}

/// What the consumer did with one bus message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// Undo applied and recorded `Compensated`.
    Compensated,

    /// The compensation record was already terminal; duplicate delivery.
    Duplicate,

    /// Not a decodable compensation message; ignored.
    Skipped,

    /// Undo failed or no routine registered; recorded
    /// `CompensationFailed`. Terminal and flagged for operator attention;
    /// there is no automatic retry of compensation.
    Failed,
}

/// Consumes compensation messages and performs the actual undo against
/// local state, recording the result on the compensation step record.
pub struct CompensationConsumer<S: SagaStore> {
    store: S,
    registry: UndoRegistry,
}

impl<S: SagaStore> CompensationConsumer<S> {
    /// Creates a consumer over the given store and undo registry.
    pub fn new(store: S, registry: UndoRegistry) -> Self {
        Self { store, registry }
    }

    /// Handles one bus message.
    ///
    /// Duplicate deliveries are detected through the compensation step
    /// record: once it is terminal the message is a no-op. Storage errors
    /// propagate; undo failures are recorded, not thrown.
    #[tracing::instrument(skip(self, message), fields(event_id = %message.event_id))]
    pub async fn handle(&self, message: &BusMessage) -> Result<ConsumeOutcome> {
        if message.topic != COMPENSATION_TOPIC {
            return Ok(ConsumeOutcome::Skipped);
        }

        let Some(command) = CompensationCommand::from_payload(&message.payload) else {
            tracing::error!("malformed compensation message, ignoring");
            return Ok(ConsumeOutcome::Skipped);
        };

        // Dedupe on the originating step: at-least-once delivery may hand
        // us the same command (same or re-sent event_id) more than once.
        let record = self.store.find_compensation_record(command.step_id).await?;
        if let Some(ref record) = record {
            if record.status != StepStatus::Started {
                tracing::debug!(
                    step_id = %command.step_id,
                    status = %record.status,
                    "compensation already settled, skipping duplicate"
                );
                return Ok(ConsumeOutcome::Duplicate);
            }
        }

        let outcome = match self.registry.get(&command.action) {
            Some(routine) => match routine.undo(&command.data).await {
                Ok(applied) => {
                    tracing::info!(
                        saga_id = %command.saga_id,
                        action = %command.action,
                        already_applied = (applied == UndoOutcome::AlreadyApplied),
                        "compensation applied"
                    );
                    metrics::counter!("saga_compensations_applied_total").increment(1);
                    ConsumeOutcome::Compensated
                }
                Err(e) => {
                    tracing::error!(
                        saga_id = %command.saga_id,
                        action = %command.action,
                        error = %e,
                        "compensation undo failed"
                    );
                    metrics::counter!("saga_compensations_failed_total").increment(1);
                    ConsumeOutcome::Failed
                }
            },
            None => {
                tracing::error!(
                    action = %command.action,
                    "no undo routine registered for compensation action"
                );
                metrics::counter!("saga_compensations_failed_total").increment(1);
                ConsumeOutcome::Failed
            }
        };

        let status = match outcome {
            ConsumeOutcome::Compensated => StepStatus::Compensated,
            _ => StepStatus::CompensationFailed,
        };
        self.settle_record(record, &command, status).await?;

        if status == StepStatus::Compensated {
            self.try_finalize_saga(command.saga_id).await?;
        }

        Ok(outcome)
    }

    /// Consumes from a bus subscription until the shutdown future resolves.
    pub async fn run<F>(&self, mut rx: broadcast::Receiver<BusMessage>, shutdown: F)
    where
        F: std::future::Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Ok(message) => {
                        if let Err(e) = self.handle(&message).await {
                            tracing::error!(error = %e, "compensation consume failed");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "compensation consumer lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::info!("compensation channel closed");
                        return;
                    }
                },
                () = &mut shutdown => {
                    tracing::info!("compensation consumer shutting down");
                    return;
                }
            }
        }
    }

    /// Writes the undo result onto the compensation step record.
    ///
    /// The dispatcher normally wrote the record in `Started` before
    /// publishing; if this consumer runs in a different service with its
    /// own saga store, a fresh record is inserted instead.
    async fn settle_record(
        &self,
        record: Option<SagaStep>,
        command: &CompensationCommand,
        status: StepStatus,
    ) -> Result<()> {
        match record {
            Some(mut record) => {
                record.status = status;
                record.completed_at = Some(Utc::now());
                self.store.update_step(&record).await
            }
            None => {
                let now = Utc::now();
                let record = SagaStep {
                    id: common::StepId::new(),
                    saga_id: command.saga_id,
                    step_name: format!("Compensate[{}]", command.action),
                    status,
                    payload: Some(command.data.clone()),
                    created_at: now,
                    completed_at: Some(now),
                    compensation_step_id: Some(command.step_id),
                };
                self.store.insert_step(&record).await
            }
        }
    }

    /// Finalizes the saga once the last compensation record settles.
    ///
    /// The saga stays `Compensating` from dispatch until every record has
    /// settled `Compensated`; a `CompensationFailed` record leaves it
    /// there for operator attention. No-op when this store has no saga row
    /// (the consumer may run in a service that only tracks records).
    async fn try_finalize_saga(&self, saga_id: SagaId) -> Result<()> {
        let Some(mut saga) = self.store.get_saga(saga_id).await? else {
            return Ok(());
        };
        if saga.status == SagaStatus::Compensating
            && self.store.compensation_settled(saga_id).await?
        {
            saga.transition(SagaStatus::Compensated);
            self.store.update_saga(&saga).await?;
            metrics::counter!("saga_compensated_total").increment(1);
            tracing::info!(saga_id = %saga.id, "saga compensated");
        }
        Ok(())
    }
}
