//! Shared types for the saga orchestration and transactional outbox subsystem.
//!
//! Provides the UUID-backed identifier newtypes used across crates and the
//! structured [`Payload`] type carried through every interface boundary.
//! Payloads are serialized to text only at the persistence edge.

pub mod ids;
pub mod payload;

pub use ids::{EventId, MessageId, SagaId, StepId};
pub use payload::Payload;
