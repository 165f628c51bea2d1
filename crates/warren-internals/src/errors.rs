use thiserror::Error;

use crate::structs::DeliveryTag;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WarrenError {
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Exchange not found: {0}")]
    ExchangeNotFound(String),

    #[error("Consumer not found: {0}")]
    ConsumerNotFound(String),

    #[error("Queue '{queue_name}' already declared with different parameters: {reason}")]
    QueueConflict { queue_name: String, reason: String },

    #[error("Exchange '{exchange_name}' already declared with different parameters: {reason}")]
    ExchangeConflict {
        exchange_name: String,
        reason: String,
    },

    #[error("Queue full: {0}")]
    QueueFull(String),

    #[error("Consumer tag already in use: {0}")]
    ConsumerTagInUse(String),

    #[error("Unknown delivery tag: {0}")]
    UnknownDeliveryTag(DeliveryTag),

    #[error("Queue '{0}' is exclusive to another connection")]
    ResourceLocked(String),

    #[error("Access refused: {0}")]
    AccessRefused(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}
