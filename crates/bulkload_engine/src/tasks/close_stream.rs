use crate::error::{SyncError, SyncResult};
use crate::launcher::TaskLauncher;
use bulkload_protocol::StreamDescriptor;
use std::sync::Arc;
use tracing::info;

pub(super) async fn run(launcher: Arc<TaskLauncher>, stream: StreamDescriptor) -> SyncResult<()> {
    let sync = launcher.sync_manager();
    let manager = sync.stream_manager(&stream)?;
    let loader = sync.take_stream_loader(&stream)?.ok_or_else(|| {
        SyncError::illegal_state(format!("no open loader to close for stream {stream}"))
    })?;
    loader.close(None).await?;
    manager.mark_succeeded()?;
    info!(
        stream = %stream,
        records = manager.record_count(),
        bytes = manager.byte_count(),
        "stream succeeded"
    );
    launcher.handle_stream_closed(&stream);
    Ok(())
}
