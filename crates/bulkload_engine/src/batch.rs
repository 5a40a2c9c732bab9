//! Batches of staged data and their lifecycle.

use bulkload_protocol::StreamDescriptor;
use std::fmt;
use std::ops::Range;
use uuid::Uuid;

/// Unique identifier of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BatchId(Uuid);

impl BatchId {
    /// Generates a new random batch id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle of a batch. States only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BatchState {
    /// Data is staged locally or remotely but not yet durable in the
    /// destination.
    Staged,
    /// Data is durable; checkpoints covering it may be flushed.
    Persisted,
    /// No further work remains for the batch.
    Complete,
}

impl BatchState {
    /// Returns true if records in this state may be checkpointed.
    pub fn is_persisted(&self) -> bool {
        *self >= BatchState::Persisted
    }
}

/// An opaque unit of staged data produced by a stream loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    /// Batch identity; stays the same as the batch advances.
    pub id: BatchId,
    /// Current lifecycle state.
    pub state: BatchState,
    /// Loader-defined location of the staged data (object key, file path...).
    pub location: Option<String>,
}

impl Batch {
    /// Creates a new batch in the given state.
    pub fn new(state: BatchState) -> Self {
        Self {
            id: BatchId::new(),
            state,
            location: None,
        }
    }

    /// Creates a staged batch at a location.
    pub fn staged(location: impl Into<String>) -> Self {
        Self {
            id: BatchId::new(),
            state: BatchState::Staged,
            location: Some(location.into()),
        }
    }

    /// Creates a batch that needs no further processing.
    pub fn complete() -> Self {
        Self::new(BatchState::Complete)
    }

    /// Returns the same batch moved to `state`.
    pub fn with_state(mut self, state: BatchState) -> Self {
        self.state = state;
        self
    }

    /// Returns true once the batch is complete.
    pub fn is_complete(&self) -> bool {
        self.state == BatchState::Complete
    }
}

/// A batch tagged with the stream and record indexes it covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchEnvelope {
    /// Producing stream.
    pub stream: StreamDescriptor,
    /// Record indexes (half-open) contained in the batch.
    pub records: Range<u64>,
    /// The batch itself.
    pub batch: Batch,
}

impl BatchEnvelope {
    /// Wraps a batch.
    pub fn new(stream: StreamDescriptor, records: Range<u64>, batch: Batch) -> Self {
        Self {
            stream,
            records,
            batch,
        }
    }

    /// Returns the envelope carrying an updated batch.
    pub fn with_batch(mut self, batch: Batch) -> Self {
        self.batch = batch;
        self
    }

    /// Number of records covered.
    pub fn record_count(&self) -> u64 {
        self.records.end.saturating_sub(self.records.start)
    }
}
