use common::{SagaId, StepId};
use thiserror::Error;

use crate::record::{SagaStatus, StepStatus};

/// Errors that can occur during saga operations.
///
/// Storage errors propagate to the caller uncaught: the orchestrator never
/// retries its own writes. Retries belong to the outer business
/// transaction.
#[derive(Debug, Error)]
pub enum SagaError {
    /// The referenced saga does not exist. A configuration or programmer
    /// error, not a retryable condition.
    #[error("Saga not found: {0}")]
    SagaNotFound(SagaId),

    /// The referenced step record does not exist.
    #[error("Saga step not found: {0}")]
    StepNotFound(StepId),

    /// The saga state machine forbids the requested transition.
    #[error("Invalid saga transition for {saga_id}: {from} -> {to}")]
    InvalidTransition {
        saga_id: SagaId,
        from: SagaStatus,
        to: SagaStatus,
    },

    /// A step record cannot move backward.
    #[error("Invalid step transition for {step_id}: {from} -> {to}")]
    InvalidStepTransition {
        step_id: StepId,
        from: StepStatus,
        to: StepStatus,
    },

    /// A compensation handler rejected a step payload.
    #[error("Compensation handler for step '{step}' failed: {reason}")]
    HandlerFailed { step: String, reason: String },

    /// Outbox error while dispatching compensation.
    #[error("Outbox error: {0}")]
    Outbox(#[from] outbox::OutboxError),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for saga operations.
pub type Result<T> = std::result::Result<T, SagaError>;
