//! Connector-supplied collaborators.
//!
//! The engine never touches storage itself. A connector implements
//! [`Destination`] and [`StreamLoader`]; the process driver supplies an
//! [`InputFlow`] and an [`OutputConsumer`].

use crate::batch::{Batch, BatchState};
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use bulkload_protocol::{
    CheckpointMessage, DestinationFile, DestinationRecord, InputMessage, StreamDescriptor,
};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Sync-wide destination hooks.
#[async_trait]
pub trait Destination: Send + Sync {
    /// Prepares the destination before any stream opens.
    async fn setup(&self) -> SyncResult<()> {
        Ok(())
    }

    /// Creates the loader for one stream. The loader is started by the
    /// open-stream task.
    fn create_stream_loader(&self, stream: &StreamDescriptor) -> SyncResult<Arc<dyn StreamLoader>>;

    /// Releases sync-wide resources. Always called, also after failures.
    async fn teardown(&self, succeeded: bool) -> SyncResult<()> {
        let _ = succeeded;
        Ok(())
    }
}

/// Writes one stream's data to the destination.
#[async_trait]
pub trait StreamLoader: Send + Sync {
    /// Opens per-stream resources (tables, upload sessions, ...).
    async fn start(&self) -> SyncResult<()> {
        Ok(())
    }

    /// Stages a chunk of records and returns the resulting batch.
    async fn process_records(&self, records: Vec<DestinationRecord>) -> SyncResult<Batch>;

    /// Transfers one whole file (file-transfer mode).
    async fn process_file(&self, file: DestinationFile) -> SyncResult<Batch> {
        Err(SyncError::destination(format!(
            "loader does not support file transfer ({})",
            file.file_path
        )))
    }

    /// Advances a batch to a later state. The default completes it.
    async fn process_batch(&self, batch: Batch) -> SyncResult<Batch> {
        Ok(batch.with_state(BatchState::Complete))
    }

    /// Closes the stream. `failure` is set when the stream failed after
    /// end-of-stream and resources can still be released cleanly.
    async fn close(&self, failure: Option<&SyncError>) -> SyncResult<()>;

    /// Force-releases resources of a stream that failed mid-flight.
    async fn abort(&self, failure: &SyncError) -> SyncResult<()> {
        self.close(Some(failure)).await
    }
}

/// Source of deserialized protocol messages.
#[async_trait]
pub trait InputFlow: Send {
    /// Returns the next message, or `None` at end of input.
    async fn next(&mut self) -> SyncResult<Option<InputMessage>>;
}

#[async_trait]
impl InputFlow for mpsc::Receiver<InputMessage> {
    async fn next(&mut self) -> SyncResult<Option<InputMessage>> {
        Ok(self.recv().await)
    }
}

/// Receives messages the destination emits back to the platform.
pub trait OutputConsumer: Send + Sync {
    /// Emits a checkpoint whose data is durable.
    fn accept_checkpoint(&self, checkpoint: CheckpointMessage) -> SyncResult<()>;
}
