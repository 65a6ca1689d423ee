//! Error model for queues and handlers.

use std::time::Duration;

use thiserror::Error;

/// Result type used by every queue operation.
pub type QueueResult<T> = Result<T, QueueError>;

/// Result type returned by handlers.
pub type HandlerResult = Result<(), HandlerError>;

/// Queue-level error.
///
/// Backends map their native failures onto these variants so the processor can
/// tell transient failures and missing resources apart from everything else.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The backend queue object does not exist (it can be recreated lazily).
    #[error("queue not found: {0}")]
    QueueNotFound(String),

    /// The message is already gone from the backend.
    #[error("message not found: {0}")]
    MessageNotFound(String),

    /// A failure worth retrying (network, 5xx-class responses).
    #[error("transient backend error: {0}")]
    Transient(String),

    /// Any other backend failure.
    #[error("backend error: {0}")]
    Backend(String),

    /// The reservation held by the caller expired or was superseded.
    #[error("reservation expired for message {0}")]
    ReservationExpired(String),

    /// The queue no longer accepts new messages.
    #[error("queue is closed")]
    Closed,

    /// Pending work did not finish within the shutdown deadline.
    #[error("timed out after {0:?} waiting for pending messages")]
    Timeout(Duration),

    /// Processing was requested without a handler.
    #[error("no handler configured for queue {0}")]
    MissingHandler(String),

    /// A background thread could not be started.
    #[error("failed to spawn thread: {0}")]
    Spawn(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl QueueError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::Transient(_))
    }

    pub fn is_queue_not_found(&self) -> bool {
        matches!(self, QueueError::QueueNotFound(_))
    }

    pub fn is_message_not_found(&self) -> bool {
        matches!(self, QueueError::MessageNotFound(_))
    }
}

/// Why a handler did not complete a message.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The message carries a different number of arguments than the handler takes.
    #[error("handler takes {expected} arguments, message has {found}")]
    ArgCount { expected: usize, found: usize },

    /// An argument could not be decoded into the handler's parameter type.
    #[error("argument {index} has an unexpected type: {source}")]
    ArgType {
        index: usize,
        #[source]
        source: serde_json::Error,
    },

    /// The message body is not a JSON argument list.
    #[error("malformed message body: {0}")]
    Body(#[source] serde_json::Error),

    #[error("handler panicked: {0}")]
    Panicked(String),

    /// The handler ran and reported a failure.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl HandlerError {
    /// Argument/payload mismatches are resolved by dropping the message
    /// without invoking the handler; they are never retried.
    pub fn is_args_mismatch(&self) -> bool {
        matches!(
            self,
            HandlerError::ArgCount { .. } | HandlerError::ArgType { .. } | HandlerError::Body(_)
        )
    }

    pub fn failed(msg: impl std::fmt::Display) -> Self {
        Self::Failed(anyhow::anyhow!("{msg}"))
    }
}
