use common::MessageId;
use thiserror::Error;

/// Errors that can occur when interacting with the outbox store.
#[derive(Debug, Error)]
pub enum OutboxError {
    /// The referenced message row does not exist.
    #[error("Outbox message not found: {0}")]
    MessageNotFound(MessageId),

    /// A message row is not in the status the operation requires.
    #[error("Outbox message {id} is {actual}, expected {expected}")]
    InvalidStatus {
        id: MessageId,
        expected: &'static str,
        actual: String,
    },

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for outbox operations.
pub type Result<T> = std::result::Result<T, OutboxError>;
