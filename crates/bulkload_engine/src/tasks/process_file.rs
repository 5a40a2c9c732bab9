use super::process_records::report_batch;
use crate::batch::BatchEnvelope;
use crate::error::{SyncError, SyncResult};
use crate::launcher::TaskLauncher;
use crate::queue::StreamInput;
use bulkload_protocol::StreamDescriptor;
use std::sync::Arc;
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
            StreamInput::File(file) => {
                let index = file.index;
                trace!(stream = %stream, path = %file.file.file_path, "transferring file");
                let batch = loader.process_file(file.file.clone()).await?;
                let envelope = BatchEnvelope::new(stream.clone(), index..index + 1, batch);
                report_batch(&launcher, &batch_tx, envelope).await?;
            }
            StreamInput::Spilled(spilled) => {
                return Err(SyncError::illegal_state(format!(
                    "spill file {} queued for stream {stream} in file-transfer mode",
                    spilled.path().display()
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
