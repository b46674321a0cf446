//! Error taxonomy for the engine's public API surface.
//!
//! Every public call returns a [`QueueResult`]; internal failures are caught
//! at component boundaries and converted into a [`QueueError`] variant.
//! Errors never cross component edges as panics.

use thiserror::Error;

use crate::types::MessageId;

/// Result alias used across the engine's public API.
pub type QueueResult<T> = Result<T, QueueError>;

/// The complete error taxonomy of the engine.
///
/// `TIMEOUT` is an expected outcome of a bounded receive, not a fault.
/// `INTERNAL_ERROR` is reserved for unexpected conditions (I/O failure,
/// invariant breach) and is always logged at the site that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// A bounded wait elapsed without a message becoming available.
    #[error("operation timed out")]
    Timeout,

    /// The named queue does not exist.
    #[error("queue not found: {0}")]
    QueueNotFound(String),

    /// A queue with the requested name already exists.
    #[error("queue already exists: {0}")]
    QueueAlreadyExists(String),

    /// The queue is at its configured count or byte capacity.
    #[error("queue full: {0}")]
    QueueFull(String),

    /// No message with the given id is known to the queue.
    #[error("message not found: {0}")]
    MessageNotFound(MessageId),

    /// The message exists but is not currently inflight.
    #[error("message not inflight: {0}")]
    NotInflight(MessageId),

    /// A caller-supplied argument failed validation.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The operation is not legal in the component's current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// No transaction with the given id is known to the coordinator.
    #[error("transaction not found: {0}")]
    TransactionNotFound(String),

    /// The transaction timed out before commit.
    #[error("transaction timed out: {0}")]
    TransactionTimeout(String),

    /// The transaction is in a state that conflicts with the request.
    #[error("transaction conflict: {0}")]
    TransactionConflict(String),

    /// Payload encryption or decryption failed.
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// Payload compression or decompression failed.
    #[error("compression failed: {0}")]
    CompressionFailed(String),

    /// A persistence operation failed after its internal retry.
    #[error("persistence failed: {0}")]
    PersistenceFailed(String),

    /// A pool or buffer allocation exceeded its configured cap.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// The operation is recognized but not supported by this build.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// An unexpected internal condition. Always logged where raised.
    #[error("internal error: {0}")]
    Internal(String),
}

impl QueueError {
    /// Stable code string for logs and health-check details.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Timeout => "TIMEOUT",
            Self::QueueNotFound(_) => "QUEUE_NOT_FOUND",
            Self::QueueAlreadyExists(_) => "QUEUE_ALREADY_EXISTS",
            Self::QueueFull(_) => "QUEUE_FULL",
            Self::MessageNotFound(_) => "MESSAGE_NOT_FOUND",
            Self::NotInflight(_) => "NOT_INFLIGHT",
            Self::InvalidParameter(_) => "INVALID_PARAMETER",
            Self::InvalidState(_) => "INVALID_STATE",
            Self::TransactionNotFound(_) => "TRANSACTION_NOT_FOUND",
            Self::TransactionTimeout(_) => "TRANSACTION_TIMEOUT",
            Self::TransactionConflict(_) => "TRANSACTION_CONFLICT",
            Self::EncryptionFailed(_) => "ENCRYPTION_FAILED",
            Self::CompressionFailed(_) => "COMPRESSION_FAILED",
            Self::PersistenceFailed(_) => "PERSISTENCE_FAILED",
            Self::OutOfMemory(_) => "OUT_OF_MEMORY",
            Self::NotSupported(_) => "NOT_SUPPORTED",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the error is an expected flow-control outcome rather than a
    /// fault (consumer timeouts and producer backpressure).
    #[must_use]
    pub fn is_flow_control(&self) -> bool {
        matches!(self, Self::Timeout | Self::QueueFull(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_unique() {
        let errors = [
            QueueError::Timeout,
            QueueError::QueueNotFound(String::new()),
            QueueError::QueueAlreadyExists(String::new()),
            QueueError::QueueFull(String::new()),
            QueueError::MessageNotFound(0),
            QueueError::NotInflight(0),
            QueueError::InvalidParameter(String::new()),
            QueueError::InvalidState(String::new()),
            QueueError::TransactionNotFound(String::new()),
            QueueError::TransactionTimeout(String::new()),
            QueueError::TransactionConflict(String::new()),
            QueueError::EncryptionFailed(String::new()),
            QueueError::CompressionFailed(String::new()),
            QueueError::PersistenceFailed(String::new()),
            QueueError::OutOfMemory(String::new()),
            QueueError::NotSupported(String::new()),
            QueueError::Internal(String::new()),
        ];
        let mut codes: Vec<&str> = errors.iter().map(QueueError::code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn flow_control_errors() {
        assert!(QueueError::Timeout.is_flow_control());
        assert!(QueueError::QueueFull("q".into()).is_flow_control());
        assert!(!QueueError::Internal("x".into()).is_flow_control());
    }

    #[test]
    fn display_includes_context() {
        let err = QueueError::QueueNotFound("orders".into());
        assert_eq!(err.to_string(), "queue not found: orders");
    }
}
