use chrono::{DateTime, Utc};
use common::{EventId, MessageId, Payload, SagaId};
use serde::{Deserialize, Serialize};

/// Lifecycle status of an outbox message row.
///
/// A row stays `Pending` across transient publish failures while its retry
/// budget remains; `Failed` is terminal and is never re-queried by the
/// publisher. The row itself stays inspectable for operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum OutboxStatus {
    /// Waiting to be published (initial state, also the retry state).
    #[default]
    Pending,

    /// Picked up by a publisher tick; publish attempt in flight.
    Processing,

    /// Published to the bus (terminal state).
    Completed,

    /// Retry budget exhausted (terminal state, operator attention).
    Failed,
}

impl OutboxStatus {
    /// Returns true if no further publish attempt will be made.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboxStatus::Completed | OutboxStatus::Failed)
    }

    /// Returns the status name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "Pending",
            OutboxStatus::Processing => "Processing",
            OutboxStatus::Completed => "Completed",
            OutboxStatus::Failed => "Failed",
        }
    }

    /// Parses a status from its string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Pending" => Some(OutboxStatus::Pending),
            "Processing" => Some(OutboxStatus::Processing),
            "Completed" => Some(OutboxStatus::Completed),
            "Failed" => Some(OutboxStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A durable outbound message awaiting (or past) publication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxMessage {
    /// Row identifier.
    pub id: MessageId,

    /// Idempotency key carried to the bus; consumers dedupe on it.
    pub event_id: EventId,

    /// Logical topic the message is addressed to.
    pub topic: String,

    /// Partitioning key, stable per entity so events about the same entity
    /// stay ordered on the bus.
    pub key: String,

    /// Opaque message body.
    pub payload: Payload,

    /// Current lifecycle status.
    pub status: OutboxStatus,

    /// Number of failed publish attempts so far.
    pub retry_count: u32,

    /// Error from the most recent failed attempt.
    pub error_message: Option<String>,

    /// When the row was inserted.
    pub created_at: DateTime<Utc>,

    /// When the row reached a terminal status.
    pub processed_at: Option<DateTime<Utc>>,

    /// Correlation to the saga that produced the message, if any.
    pub saga_id: Option<SagaId>,
}

impl OutboxMessage {
    /// Materializes a pending row from its insert form.
    pub fn from_new(new: NewOutboxMessage) -> Self {
        Self {
            id: MessageId::new(),
            event_id: EventId::new(),
            topic: new.topic,
            key: new.key,
            payload: new.payload,
            status: OutboxStatus::Pending,
            retry_count: 0,
            error_message: None,
            created_at: Utc::now(),
            processed_at: None,
            saga_id: new.saga_id,
        }
    }

    /// Builds the wire form sent to the event bus.
    pub fn to_bus_message(&self) -> BusMessage {
        BusMessage {
            event_id: self.event_id,
            topic: self.topic.clone(),
            key: self.key.clone(),
            payload: self.payload.clone(),
            saga_id: self.saga_id,
        }
    }
}

/// Insert form for an outbox message; the store assigns identifiers and
/// timestamps.
#[derive(Debug, Clone)]
pub struct NewOutboxMessage {
    pub topic: String,
    pub key: String,
    pub payload: Payload,
    pub saga_id: Option<SagaId>,
}

impl NewOutboxMessage {
    /// Creates an insert form addressed to a topic.
    pub fn new(topic: impl Into<String>, key: impl Into<String>, payload: Payload) -> Self {
        Self {
            topic: topic.into(),
            key: key.into(),
            payload,
            saga_id: None,
        }
    }

    /// Correlates the message with a saga.
    pub fn for_saga(mut self, saga_id: SagaId) -> Self {
        self.saga_id = Some(saga_id);
        self
    }
}

/// The envelope actually published to the event bus.
///
/// Carries the `event_id` so consumers can tolerate at-least-once delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMessage {
    pub event_id: EventId,
    pub topic: String,
    pub key: String,
    pub payload: Payload,
    pub saga_id: Option<SagaId>,
}
