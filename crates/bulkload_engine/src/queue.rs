//! Bounded queues between pipeline tasks.
//!
//! ```text
//! InputConsumer ──records──► SpillToDisk ──spilled files──► ProcessRecords ─┐
//!       │  └──────────────files (file transfer)──────────► ProcessFile ────┤
//!       │                                                                  ▼
//!       └──checkpoints──► UpdateCheckpoints                 batches ──► ProcessBatch
//! ```
//!
//! Every queue is a bounded tokio channel, so a slow consumer suspends its
//! producer. Receivers can be taken once. Producers that end the flow (input
//! and spill) also take their senders, and dropping them closes the queues
//! downstream.

use crate::batch::BatchEnvelope;
use crate::config::EngineConfig;
use crate::error::{SyncError, SyncResult};
use crate::reservation::Reserved;
use crate::stream_manager::StreamManager;
use bulkload_protocol::{CheckpointMessage, DestinationCatalog, DestinationFile, DestinationRecord, StreamDescriptor};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::path::Path;
use tempfile::TempPath;
use tokio::sync::mpsc;
use tracing::trace;

/// A record with its stream-local index.
#[derive(Debug, Clone)]
pub struct IndexedRecord {
    /// Index assigned by the stream manager.
    pub index: u64,
    /// The record.
    pub record: DestinationRecord,
}

/// A file with its stream-local index.
#[derive(Debug, Clone)]
pub struct IndexedFile {
    /// Index assigned by the stream manager.
    pub index: u64,
    /// The file.
    pub file: DestinationFile,
}

/// Event on the shared record queue.
#[derive(Debug)]
pub enum RecordEvent {
    /// A record to stage.
    Record(Reserved<IndexedRecord>),
    /// The stream ended.
    EndOfStream(StreamDescriptor),
}

impl RecordEvent {
    /// The stream the event belongs to.
    pub fn stream(&self) -> &StreamDescriptor {
        match self {
            RecordEvent::Record(record) => &record.record.stream,
            RecordEvent::EndOfStream(stream) => stream,
        }
    }
}

/// Records staged to a local file.
#[derive(Debug)]
pub struct SpilledFile {
    /// Temp file holding JSON lines; removed on drop.
    pub path: TempPath,
    /// Record indexes contained in the file.
    pub records: Range<u64>,
    /// Bytes reserved for the records, released when the file is dropped.
    pub reservation: Reserved<()>,
}

impl SpilledFile {
    /// Location on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of records in the file.
    pub fn record_count(&self) -> u64 {
        self.records.end - self.records.start
    }
}

/// Input for one stream's processing task.
#[derive(Debug)]
pub enum StreamInput {
    /// A spill file (staged mode).
    Spilled(SpilledFile),
    /// A whole file (file-transfer mode).
    File(Reserved<IndexedFile>),
    /// No more input for the stream.
    EndOfStream,
}

/// A checkpoint stamped with the stream positions it covers.
#[derive(Debug, Clone)]
pub struct StampedCheckpoint {
    /// The checkpoint as received.
    pub message: CheckpointMessage,
    /// For every covered stream, the number of records that must be
    /// persisted before the checkpoint may be emitted.
    pub positions: BTreeMap<StreamDescriptor, u64>,
}

/// Sends `value`, giving up if the stream fails first.
///
/// Returns `Ok(false)` when the send was abandoned. A stream's consumer only
/// drops its receiver early when the stream fails, so a closed queue waits
/// for that failure to be recorded.
pub(crate) async fn send_unless_failed<T>(
    tx: &mpsc::Sender<T>,
    manager: &StreamManager,
    value: T,
    queue: &'static str,
) -> SyncResult<bool> {
    if manager.is_failed() {
        return Ok(false);
    }
    tokio::select! {
        sent = tx.send(value) => {
            if sent.is_err() {
                trace!(stream = %manager.stream(), queue, "consumer gone, waiting for stream failure");
                manager.await_failed().await;
                return Ok(false);
            }
            Ok(true)
        }
        _ = manager.await_failed() => Ok(false),
    }
}

/// All queues of one sync.
pub struct PipelineQueues {
    record_tx: Mutex<Option<mpsc::Sender<RecordEvent>>>,
    record_rx: Mutex<Option<mpsc::Receiver<RecordEvent>>>,
    stream_txs: Mutex<Option<HashMap<StreamDescriptor, mpsc::Sender<StreamInput>>>>,
    stream_rxs: Mutex<HashMap<StreamDescriptor, mpsc::Receiver<StreamInput>>>,
    batch_tx: mpsc::Sender<BatchEnvelope>,
    batch_rx: Mutex<Option<mpsc::Receiver<BatchEnvelope>>>,
    checkpoint_tx: Mutex<Option<mpsc::Sender<Reserved<StampedCheckpoint>>>>,
    checkpoint_rx: Mutex<Option<mpsc::Receiver<Reserved<StampedCheckpoint>>>>,
}

impl PipelineQueues {
    /// Creates the queues for every catalog stream.
    pub fn new(config: &EngineConfig, catalog: &DestinationCatalog) -> Self {
        let (record_tx, record_rx) = mpsc::channel(config.record_queue_capacity);
        let (batch_tx, batch_rx) = mpsc::channel(config.batch_queue_capacity);
        let (checkpoint_tx, checkpoint_rx) = mpsc::channel(config.checkpoint_queue_capacity);

        let mut stream_txs = HashMap::with_capacity(catalog.len());
        let mut stream_rxs = HashMap::with_capacity(catalog.len());
        for stream in catalog.streams() {
            let (tx, rx) = mpsc::channel(config.spill_queue_capacity);
            stream_txs.insert(stream.clone(), tx);
            stream_rxs.insert(stream.clone(), rx);
        }

        Self {
            record_tx: Mutex::new(Some(record_tx)),
            record_rx: Mutex::new(Some(record_rx)),
            stream_txs: Mutex::new(Some(stream_txs)),
            stream_rxs: Mutex::new(stream_rxs),
            batch_tx,
            batch_rx: Mutex::new(Some(batch_rx)),
            checkpoint_tx: Mutex::new(Some(checkpoint_tx)),
            checkpoint_rx: Mutex::new(Some(checkpoint_rx)),
        }
    }

    /// Takes the sending side of the shared record queue.
    pub fn take_record_sender(&self) -> SyncResult<mpsc::Sender<RecordEvent>> {
        take(&self.record_tx, "record sender")
    }

    /// Takes the receiving side of the shared record queue.
    pub fn take_record_receiver(&self) -> SyncResult<mpsc::Receiver<RecordEvent>> {
        take(&self.record_rx, "record receiver")
    }

    /// Takes the senders of every per-stream input queue.
    pub fn take_stream_senders(
        &self,
    ) -> SyncResult<HashMap<StreamDescriptor, mpsc::Sender<StreamInput>>> {
        take(&self.stream_txs, "stream input senders")
    }

    /// Takes one stream's input receiver.
    pub fn take_stream_receiver(
        &self,
        stream: &StreamDescriptor,
    ) -> SyncResult<mpsc::Receiver<StreamInput>> {
        self.stream_rxs.lock().remove(stream).ok_or_else(|| {
            SyncError::illegal_state(format!("input receiver for {stream} already taken"))
        })
    }

    /// Drops a stream's input receiver if no task took it, closing the
    /// queue and releasing whatever was buffered. Returns the number of
    /// buffered inputs dropped.
    pub fn discard_stream_input(&self, stream: &StreamDescriptor) -> usize {
        let Some(mut rx) = self.stream_rxs.lock().remove(stream) else {
            return 0;
        };
        rx.close();
        let mut dropped = 0;
        while rx.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }

    /// A sender for the shared batch queue.
    pub fn batch_sender(&self) -> mpsc::Sender<BatchEnvelope> {
        self.batch_tx.clone()
    }

    /// Takes the receiving side of the batch queue.
    pub fn take_batch_receiver(&self) -> SyncResult<mpsc::Receiver<BatchEnvelope>> {
        take(&self.batch_rx, "batch receiver")
    }

    /// Takes the sending side of the checkpoint queue.
    pub fn take_checkpoint_sender(&self) -> SyncResult<mpsc::Sender<Reserved<StampedCheckpoint>>> {
        take(&self.checkpoint_tx, "checkpoint sender")
    }

    /// Takes the receiving side of the checkpoint queue.
    pub fn take_checkpoint_receiver(
        &self,
    ) -> SyncResult<mpsc::Receiver<Reserved<StampedCheckpoint>>> {
        take(&self.checkpoint_rx, "checkpoint receiver")
    }
}

fn take<T>(slot: &Mutex<Option<T>>, what: &str) -> SyncResult<T> {
    slot.lock()
        .take()
        .ok_or_else(|| SyncError::illegal_state(format!("{what} already taken")))
}
