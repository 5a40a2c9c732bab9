use crate::batch::BatchEnvelope;
use crate::error::{SyncError, SyncResult};
use crate::launcher::TaskLauncher;
use crate::queue::StreamInput;
use bulkload_protocol::{DestinationRecord, StreamDescriptor};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

pub(super) async fn run(launcher: Arc<TaskLauncher>, stream: StreamDescriptor) -> SyncResult<()> {
    let mut rx = launcher.queues().take_stream_receiver(&stream)?;
    let loader = launcher
        .sync_manager()
        .get_or_await_stream_loader(&stream)
        .await?;
    let batch_tx = launcher.queues().batch_sender();

    while let Some(input) = rx.recv().await {
        match input {
            StreamInput::Spilled(spilled) => {
                let records = read_spill_file(spilled.path().to_path_buf()).await?;
                trace!(stream = %stream, records = records.len(), "processing spill file");
                let batch = loader.process_records(records).await?;
                let envelope = BatchEnvelope::new(stream.clone(), spilled.records.clone(), batch);
                report_batch(&launcher, &batch_tx, envelope).await?;
            }
            StreamInput::File(file) => {
                return Err(SyncError::illegal_state(format!(
                    "file {} queued for stream {stream} in staged mode",
                    file.file.file_path
                )));
            }
            StreamInput::EndOfStream => {
                debug!(stream = %stream, "stream input drained");
                return launcher.handle_end_of_stream(&stream);
            }
        }
    }
    Ok(())
}

/// Reports a batch and queues it for completion unless it already is
/// complete.
pub(super) async fn report_batch(
    launcher: &Arc<TaskLauncher>,
    batch_tx: &mpsc::Sender<BatchEnvelope>,
    envelope: BatchEnvelope,
) -> SyncResult<()> {
    launcher.handle_new_batch(envelope.clone())?;
    if !envelope.batch.is_complete() {
        batch_tx
            .send(envelope)
            .await
            .map_err(|_| SyncError::QueueClosed("batch"))?;
    }
    Ok(())
}

async fn read_spill_file(path: PathBuf) -> SyncResult<Vec<DestinationRecord>> {
    tokio::task::spawn_blocking(move || -> SyncResult<Vec<DestinationRecord>> {
        let contents = std::fs::read_to_string(&path)?;
        contents
            .lines()
            .map(|line| serde_json::from_str(line).map_err(SyncError::from))
            .collect()
    })
    .await
    .map_err(|err| SyncError::illegal_state(format!("spill reader did not complete: {err}")))?
}
