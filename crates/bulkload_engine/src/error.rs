//! Error types for the sync engine.

use bulkload_protocol::{CatalogError, StreamDescriptor};
use std::sync::Arc;
use thiserror::Error;

/// Result type for engine operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// A failure cause shared between stream state, callbacks and the final
/// sync result.
pub type SharedError = Arc<SyncError>;

/// Errors that can occur while running a sync.
#[derive(Error, Debug)]
pub enum SyncError {
    /// A state-machine invariant was violated. Indicates a logic defect
    /// upstream, never retried.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// The stream is not part of the configured catalog.
    #[error("stream {0} is not in the catalog")]
    UnknownStream(StreamDescriptor),

    /// The catalog could not be built.
    #[error("invalid catalog: {0}")]
    Catalog(#[from] CatalogError),

    /// Failure raised by connector-supplied code.
    #[error("destination error: {message}")]
    Destination {
        /// Error message.
        message: String,
        /// Underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The stream failed before the operation could complete.
    #[error("stream {stream} failed")]
    StreamFailed {
        /// The failed stream.
        stream: StreamDescriptor,
        /// Original failure.
        #[source]
        cause: SharedError,
    },

    /// Every stream in the sync failed.
    #[error("all streams failed")]
    AllStreamsFailed {
        /// Failure of the last stream to fail.
        #[source]
        last: SharedError,
    },

    /// The sync failed. Carries the failure that triggered it.
    #[error("sync failed")]
    SyncFailed(#[source] SharedError),

    /// Input ended before every stream reported end-of-stream.
    #[error("input ended without end-of-stream for {} stream(s)", .streams.len())]
    IncompleteInput {
        /// Streams missing their end-of-stream marker.
        streams: Vec<StreamDescriptor>,
    },

    /// A queue was closed while a producer or consumer still needed it.
    #[error("queue closed: {0}")]
    QueueClosed(&'static str),

    /// I/O error while staging data.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error while staging data.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid engine configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SyncError {
    /// Creates an illegal-state error.
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState(message.into())
    }

    /// Creates a destination error without an underlying cause.
    pub fn destination(message: impl Into<String>) -> Self {
        Self::Destination {
            message: message.into(),
            source: None,
        }
    }

    /// Wraps a connector error.
    pub fn destination_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Destination {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Returns true for invariant violations.
    pub fn is_illegal_state(&self) -> bool {
        matches!(self, SyncError::IllegalState(_))
    }

    /// Follows `SyncFailed`/`StreamFailed`/`AllStreamsFailed` wrappers down to
    /// the failure that started the chain.
    pub fn root_cause(&self) -> &SyncError {
        match self {
            SyncError::SyncFailed(cause)
            | SyncError::StreamFailed { cause, .. }
            | SyncError::AllStreamsFailed { last: cause } => cause.root_cause(),
            other => other,
        }
    }
}
