//! Input consumption.
//!
//! Reads the input flow to its end, counting every record against its
//! stream, reserving memory for it and routing it to the pipeline. Records of
//! failed streams are counted out and dropped.

use crate::destination::InputFlow;
use crate::error::{SyncError, SyncResult};
use crate::launcher::TaskLauncher;
use crate::queue::{send_unless_failed, IndexedFile, IndexedRecord, RecordEvent, StampedCheckpoint, StreamInput};
use bulkload_protocol::{CheckpointMessage, CheckpointScope, InputMessage, StreamDescriptor};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

enum Route {
    Records(mpsc::Sender<RecordEvent>),
    Files(HashMap<StreamDescriptor, mpsc::Sender<StreamInput>>),
}

pub(super) async fn run(launcher: Arc<TaskLauncher>, mut input: Box<dyn InputFlow>) -> SyncResult<()> {
    let sync = launcher.sync_manager();
    let queues = launcher.queues();
    let reservations = launcher.reservations();
    let checkpoint_tx = queues.take_checkpoint_sender()?;
    let route = if launcher.config().file_transfer {
        Route::Files(queues.take_stream_senders()?)
    } else {
        Route::Records(queues.take_record_sender()?)
    };

    let mut messages = 0u64;
    let mut dropped = 0u64;
    while let Some(message) = input.next().await? {
        messages += 1;
        let bytes = message.size_hint();
        match message {
            InputMessage::Record(record) => {
                let Route::Records(tx) = &route else {
                    return Err(SyncError::illegal_state(format!(
                        "record for stream {} received in file-transfer mode",
                        record.stream
                    )));
                };
                let manager = sync.stream_manager(&record.stream)?;
                let Some(index) = manager.count_incoming_record(bytes)? else {
                    dropped += 1;
                    continue;
                };
                let reserved = reservations
                    .reserve(bytes, IndexedRecord { index, record })
                    .await?;
                tx.send(RecordEvent::Record(reserved))
                    .await
                    .map_err(|_| SyncError::QueueClosed("record"))?;
            }
            InputMessage::File(file) => {
                let Route::Files(txs) = &route else {
                    return Err(SyncError::illegal_state(format!(
                        "file for stream {} received in staged mode",
                        file.stream
                    )));
                };
                let manager = sync.stream_manager(&file.stream)?;
                let tx = txs
                    .get(&file.stream)
                    .ok_or_else(|| SyncError::UnknownStream(file.stream.clone()))?;
                let Some(index) = manager.count_incoming_record(file.size_bytes)? else {
                    dropped += 1;
                    continue;
                };
                let reserved = reservations
                    .reserve(bytes, IndexedFile { index, file })
                    .await?;
                if !send_unless_failed(tx, &manager, StreamInput::File(reserved), "stream input").await? {
                    dropped += 1;
                }
            }
            InputMessage::EndOfStream { stream } => {
                let manager = sync.stream_manager(&stream)?;
                let Some(count) = manager.mark_end_of_stream()? else {
                    continue;
                };
                debug!(stream = %stream, records = count, "end of stream");
                match &route {
                    Route::Records(tx) => tx
                        .send(RecordEvent::EndOfStream(stream))
                        .await
                        .map_err(|_| SyncError::QueueClosed("record"))?,
                    Route::Files(txs) => {
                        if let Some(tx) = txs.get(&stream) {
                            send_unless_failed(tx, &manager, StreamInput::EndOfStream, "stream input").await?;
                        }
                    }
                }
            }
            InputMessage::Checkpoint(checkpoint) => {
                let stamped = stamp(&launcher, checkpoint)?;
                trace!(positions = stamped.positions.len(), "checkpoint received");
                let reserved = reservations.reserve(bytes, stamped).await?;
                checkpoint_tx
                    .send(reserved)
                    .await
                    .map_err(|_| SyncError::QueueClosed("checkpoint"))?;
            }
        }
    }

    let incomplete: Vec<_> = sync
        .stream_managers()
        .filter(|manager| !manager.end_of_stream_marked() && !manager.is_failed())
        .map(|manager| manager.stream().clone())
        .collect();
    if !incomplete.is_empty() {
        return Err(SyncError::IncompleteInput { streams: incomplete });
    }
    info!(messages, dropped, "input consumed");
    Ok(())
}

/// Records, for every stream the checkpoint covers, how many records arrived
/// before it.
fn stamp(launcher: &TaskLauncher, message: CheckpointMessage) -> SyncResult<StampedCheckpoint> {
    let sync = launcher.sync_manager();
    let positions = match &message.scope {
        CheckpointScope::Stream(stream) => {
            let manager = sync.stream_manager(stream)?;
            BTreeMap::from([(stream.clone(), manager.record_count())])
        }
        CheckpointScope::Global => sync
            .stream_managers()
            .map(|manager| (manager.stream().clone(), manager.record_count()))
            .collect(),
    };
    Ok(StampedCheckpoint { message, positions })
}
