use thiserror::Error;
use warren_internals::{ConnectionId, WarrenError};

/// Broker-level errors for the Warren message broker
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Error raised by the routing, queueing or storage layers
    #[error(transparent)]
    Warren(#[from] WarrenError),

    /// Operation attempted on a connection that was already closed
    #[error("Connection {0} is closed")]
    ConnectionClosed(ConnectionId),

    /// Invalid consumer configuration
    #[error("Invalid consumer configuration: {reason}")]
    InvalidConsumerConfig { reason: String },

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

/// Protocol-level class of a failure, what a transport would put in its
/// status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    InvalidState,
    AccessRefused,
    InvalidArgument,
    Internal,
}

impl BrokerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BrokerError::Warren(err) => match err {
                WarrenError::QueueNotFound(_)
                | WarrenError::ExchangeNotFound(_)
                | WarrenError::ConsumerNotFound(_) => ErrorKind::NotFound,
                WarrenError::QueueConflict { .. }
                | WarrenError::ExchangeConflict { .. }
                | WarrenError::ConsumerTagInUse(_) => ErrorKind::Conflict,
                WarrenError::UnknownDeliveryTag(_) => ErrorKind::InvalidState,
                WarrenError::ResourceLocked(_) | WarrenError::AccessRefused(_) => {
                    ErrorKind::AccessRefused
                }
                WarrenError::InvalidArgument(_) => ErrorKind::InvalidArgument,
                WarrenError::QueueFull(_)
                | WarrenError::Persistence(_)
                | WarrenError::InternalError(_) => ErrorKind::Internal,
            },
            BrokerError::ConnectionClosed(_) => ErrorKind::InvalidState,
            BrokerError::InvalidConsumerConfig { .. } => ErrorKind::InvalidArgument,
            BrokerError::Config(_) => ErrorKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BrokerError::from(WarrenError::QueueNotFound("test_queue".to_string()));
        assert_eq!(err.to_string(), "Queue not found: test_queue");

        assert_eq!(BrokerError::ConnectionClosed(3).to_string(), "Connection 3 is closed");

        let err = BrokerError::InvalidConsumerConfig {
            reason: "consumer tag must not be empty".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid consumer configuration: consumer tag must not be empty"
        );
    }

    #[test]
    fn test_error_kind_mapping() {
        let cases = [
            (WarrenError::ExchangeNotFound("logs".into()), ErrorKind::NotFound),
            (
                WarrenError::QueueConflict {
                    queue_name: "q".into(),
                    reason: "durable".into(),
                },
                ErrorKind::Conflict,
            ),
            (WarrenError::ConsumerTagInUse("c".into()), ErrorKind::Conflict),
            (WarrenError::UnknownDeliveryTag(9), ErrorKind::InvalidState),
            (WarrenError::ResourceLocked("q".into()), ErrorKind::AccessRefused),
            (WarrenError::InvalidArgument("x".into()), ErrorKind::InvalidArgument),
            (WarrenError::Persistence("disk".into()), ErrorKind::Internal),
        ];
        for (err, kind) in cases {
            assert_eq!(BrokerError::from(err).kind(), kind);
        }

        assert_eq!(BrokerError::ConnectionClosed(1).kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn test_error_source() {
        use std::error::Error;

        let err = BrokerError::Config(config::ConfigError::Message("bad".into()));
        assert!(err.to_string().contains("bad"));
        assert!(err.source().is_some());
    }
}
