//! Saga orchestration with outbox-routed compensation.
//!
//! A saga tracks a multi-step business operation that spans service
//! boundaries. Steps are recorded as they complete; when one fails, the
//! previously completed steps are compensated in reverse chronological
//! order. Compensation instructions travel through the transactional
//! outbox and the event bus rather than direct calls, because the entity
//! to undo may live in a different service than the one that detected the
//! failure.
//!
//! The crate provides:
//! - [`SagaManager`] — starts sagas, records step outcomes, decides
//!   completion, and triggers compensation.
//! - [`CompensationDispatcher`] — turns a failing saga's completed steps
//!   into outbox messages via a per-step-type handler registry.
//! - [`CompensationConsumer`] — executes undo actions received from the
//!   bus, idempotently.
//! - [`SagaStore`] implementations for memory and PostgreSQL.

pub mod compensation;
pub mod consumer;
pub mod definitions;
pub mod error;
pub mod manager;
pub mod memory;
pub mod postgres;
pub mod record;
pub mod store;
pub mod sweep;

pub use compensation::{
    CompensationCommand, CompensationDispatcher, CompensationHandler, CompensationLog,
    CompensationRegistry, COMPENSATION_TOPIC,
};
pub use consumer::{CompensationConsumer, ConsumeOutcome, UndoAction, UndoOutcome, UndoRegistry};
pub use definitions::SagaDefinitions;
pub use error::{Result, SagaError};
pub use manager::SagaManager;
pub use memory::{InMemoryCompensationLog, InMemorySagaStore};
pub use postgres::{PostgresCompensationLog, PostgresSagaStore};
pub use record::{Saga, SagaStatus, SagaStep, StepStatus};
pub use store::{SagaStore, SagaStoreExt};
pub use sweep::StalledSagaSweep;
