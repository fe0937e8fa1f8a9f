//! Compensation dispatch: turning a failing saga's completed steps into
//! undo instructions routed through the outbox.

use std::collections::HashMap;

use async_trait::async_trait;
use common::{Payload, SagaId, StepId};
use outbox::{NewOutboxMessage, OutboxMessage};
use serde::{Deserialize, Serialize};

use crate::record::{Saga, SagaStatus, SagaStep};
use crate::store::SagaStore;
use crate::Result;

/// Shared topic carrying compensation instructions between services.
pub const COMPENSATION_TOPIC: &str = "saga-compensation";

/// An undo instruction for one completed step.
///
/// Published on [`COMPENSATION_TOPIC`]; the consumer dispatches on
/// `action` and hands `data` to the matching undo routine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationCommand {
    /// The saga being compensated.
    pub saga_id: SagaId,

    /// The forward step this command undoes.
    pub step_id: StepId,

    /// Tag selecting the undo routine (e.g. "DELETE_AUTH_USER").
    pub action: String,

    /// Whatever the undo action needs (entity ids, before-values).
    pub data: Payload,
}

impl CompensationCommand {
    /// Creates a command undoing `step` with the given action tag.
    pub fn new(step: &SagaStep, action: impl Into<String>, data: Payload) -> Self {
        Self {
            saga_id: step.saga_id,
            step_id: step.id,
            action: action.into(),
            data,
        }
    }

    /// Serializes into the wire payload shape
    /// `{sagaId, stepId, action, ...data}`.
    pub fn to_payload(&self) -> Payload {
        let mut payload = Payload::new()
            .with("saga_id", self.saga_id.to_string())
            .with("step_id", self.step_id.to_string())
            .with("action", self.action.as_str());
        payload.insert("data", self.data.to_json());
        payload
    }

    /// Decodes a command from a bus payload. Returns `None` when required
    /// fields are absent or malformed.
    pub fn from_payload(payload: &Payload) -> Option<Self> {
        Some(Self {
            saga_id: SagaId::from_uuid(payload.get_uuid("saga_id")?),
            step_id: StepId::from_uuid(payload.get_uuid("step_id")?),
            action: payload.get_str("action")?.to_string(),
            data: payload
                .get("data")
                .cloned()
                .map(Payload::from_json)
                .unwrap_or_default(),
        })
    }
}

/// Builds the compensation command for one step type.
///
/// Supplied by the business module that owns the step; the orchestrator
/// never interprets step payloads itself.
pub trait CompensationHandler: Send + Sync {
    /// Builds the undo command from the step's stored payload.
    fn build(&self, step: &SagaStep) -> Result<CompensationCommand>;
}

impl<F> CompensationHandler for F
where
    F: Fn(&SagaStep) -> Result<CompensationCommand> + Send + Sync,
{
    fn build(&self, step: &SagaStep) -> Result<CompensationCommand> {
        self(step)
    }
}

/// Registry mapping step-name tags to compensation handlers.
///
/// Built at startup by each business module registering its own steps; no
/// orchestrator change is needed to add a step type.
#[derive(Default)]
pub struct CompensationRegistry {
    handlers: HashMap<String, Box<dyn CompensationHandler>>,
}

impl CompensationRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for a step name, builder style.
    pub fn register(
        mut self,
        step_name: impl Into<String>,
        handler: impl CompensationHandler + 'static,
    ) -> Self {
        self.handlers.insert(step_name.into(), Box::new(handler));
        self
    }

    /// Looks up the handler for a step name.
    pub fn get(&self, step_name: &str) -> Option<&dyn CompensationHandler> {
        self.handlers.get(step_name).map(Box::as_ref)
    }

    /// Number of registered step types.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Persists one compensation dispatch: the step record and its outbox
/// message must commit as a unit, so a crash between the two can never
/// leave a record whose message was lost. A record without a message would
/// pass the idempotency existence check forever and the undo would never
/// run.
#[async_trait]
pub trait CompensationLog: Send + Sync {
    /// Writes the compensation record and enqueues its outbox message.
    async fn append(&self, record: &SagaStep, message: NewOutboxMessage) -> Result<OutboxMessage>;
}

/// Generates the undo plan for a saga entering compensation.
///
/// For each completed forward step, newest first, the registered handler
/// builds one outbox message on the shared compensation topic and a
/// compensation step record is written in `Started`, linked to the
/// original through `compensation_step_id`. Steps without a registered
/// handler are logged and skipped: a non-fatal gap, not an orchestrator
/// error.
pub struct CompensationDispatcher {
    registry: CompensationRegistry,
}

impl CompensationDispatcher {
    /// Creates a dispatcher over the given handler registry.
    pub fn new(registry: CompensationRegistry) -> Self {
        Self { registry }
    }

    /// Emits the undo plan for `saga`. Returns the number of compensation
    /// messages issued.
    ///
    /// Idempotent per step: a forward step that already has a compensation
    /// record is not dispatched again. Each record commits together with
    /// its outbox message through the [`CompensationLog`].
    #[tracing::instrument(skip(self, saga, store, log), fields(saga_id = %saga.id))]
    pub async fn dispatch<S, L>(&self, saga: &mut Saga, store: &S, log: &L) -> Result<usize>
    where
        S: SagaStore,
        L: CompensationLog,
    {
        let completed = store.completed_steps_desc(saga.id).await?;
        let mut dispatched = 0;

        for step in &completed {
            if store.find_compensation_record(step.id).await?.is_some() {
                tracing::debug!(step = %step.step_name, "compensation already dispatched");
                continue;
            }

            let Some(handler) = self.registry.get(&step.step_name) else {
                tracing::warn!(
                    step = %step.step_name,
                    "no compensation handler registered, skipping"
                );
                continue;
            };

            let command = handler.build(step)?;
            let record = SagaStep::compensation_for(step);

            log.append(
                &record,
                NewOutboxMessage::new(COMPENSATION_TOPIC, saga.id.to_string(), command.to_payload())
                    .for_saga(saga.id),
            )
            .await?;

            tracing::info!(
                step = %step.step_name,
                action = %command.action,
                "compensation dispatched"
            );
            metrics::counter!("saga_compensations_dispatched_total").increment(1);
            dispatched += 1;
        }

        // Re-assert across the loop; the consumer settles each record and
        // finalizes the saga once all of them have.
        saga.transition(SagaStatus::Compensating);
        store.update_saga(saga).await?;

        Ok(dispatched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::StepStatus;

    #[test]
    fn command_payload_roundtrip() {
        let step = SagaStep::forward(
            SagaId::new(),
            "CreateAuthUser",
            StepStatus::Completed,
            Some(Payload::new().with("user_id", "u-1")),
        );
        let command = CompensationCommand::new(
            &step,
            "DELETE_AUTH_USER",
            Payload::new().with("user_id", "u-1"),
        );

        let payload = command.to_payload();
        let decoded = CompensationCommand::from_payload(&payload).unwrap();

        assert_eq!(decoded.saga_id, step.saga_id);
        assert_eq!(decoded.step_id, step.id);
        assert_eq!(decoded.action, "DELETE_AUTH_USER");
        assert_eq!(decoded.data.get_str("user_id"), Some("u-1"));
    }

    #[test]
    fn from_payload_rejects_missing_fields() {
        assert!(CompensationCommand::from_payload(&Payload::new()).is_none());

        let partial = Payload::new().with("saga_id", SagaId::new().to_string());
        assert!(CompensationCommand::from_payload(&partial).is_none());
    }

    #[test]
    fn registry_lookup() {
        let registry = CompensationRegistry::new().register(
            "CreateAuthUser",
            |step: &SagaStep| -> Result<CompensationCommand> {
                Ok(CompensationCommand::new(
                    step,
                    "DELETE_AUTH_USER",
                    Payload::new(),
                ))
            },
        );

        assert_eq!(registry.len(), 1);
        assert!(registry.get("CreateAuthUser").is_some());
        assert!(registry.get("Unknown").is_none());
    }
}
