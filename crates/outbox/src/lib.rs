//! Transactional outbox implementation.
//!
//! An outbox row is written in the same local transaction as the state
//! change it announces; the [`OutboxPublisher`] then moves pending rows to
//! the event bus on a fixed-interval poll, owning all retry bookkeeping.
//! Delivery is at-least-once: consumers dedupe on the message's
//! [`EventId`](common::EventId).

pub mod bus;
pub mod error;
pub mod memory;
pub mod message;
pub mod postgres;
pub mod publisher;
pub mod store;

pub use bus::{BusError, EventBus, InProcessBus};
pub use error::{OutboxError, Result};
pub use memory::InMemoryOutboxStore;
pub use message::{BusMessage, NewOutboxMessage, OutboxMessage, OutboxStatus};
pub use postgres::PostgresOutboxStore;
pub use publisher::{OutboxPublisher, PublisherConfig};
pub use store::OutboxStore;
