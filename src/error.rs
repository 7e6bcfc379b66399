//! Error types for the batch manager

use thiserror::Error;
use uuid::Uuid;

use crate::types::MessageType;

/// Result type for batch manager operations
pub type BatchResult<T> = Result<T, BatchError>;

#[derive(Error, Debug)]
pub enum BatchError {
    /// A required collaborator was not supplied to the builder
    #[error("missing required dependency: {0}")]
    MissingDependency(&'static str),

    /// Two registrations claimed the same message type
    #[error("a dispatcher is already registered for message type '{0}'")]
    DuplicateDispatcher(MessageType),

    #[error("batch manager already started")]
    AlreadyStarted,

    #[error("no dispatcher registered for message type '{0}'")]
    NoDispatcher(MessageType),

    /// Not every data item of the message has arrived yet
    #[error("data for message {0} is not yet available")]
    DataNotAvailable(Uuid),

    /// The processor for a routing key exited before accepting the work
    #[error("batch processor '{0}' was disposed")]
    ProcessorDisposed(String),

    #[error("private batch {0} has no group")]
    MissingGroup(Uuid),

    #[error("offset '{0}' could not be restored")]
    OffsetNotFound(String),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("dispatch failed: {0}")]
    Dispatch(#[source] anyhow::Error),

    #[error("store error: {0}")]
    Store(#[source] anyhow::Error),

    #[error("operation cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),
}

impl BatchError {
    /// Recover a typed error that crossed a store group boundary
    pub fn from_group(err: anyhow::Error) -> Self {
        match err.downcast::<BatchError>() {
            Ok(typed) => typed,
            Err(other) => BatchError::Store(other),
        }
    }

    /// Whether retrying the failed operation could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BatchError::Store(_) | BatchError::Dispatch(_) | BatchError::OffsetNotFound(_)
        )
    }
}
