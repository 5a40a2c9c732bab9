use crate::destination::Destination;
use crate::error::SyncResult;
use crate::launcher::TaskLauncher;
use bulkload_protocol::StreamDescriptor;
use std::sync::Arc;
use tracing::{debug, info};

/// Creates the loader, registers it and starts it.
///
/// The loader is registered before `start` so that a failure while starting
/// finds it in the sync manager and aborts it.
pub(super) async fn run(
    launcher: Arc<TaskLauncher>,
    destination: Arc<dyn Destination>,
    stream: StreamDescriptor,
) -> SyncResult<()> {
    let loader = destination.create_stream_loader(&stream)?;
    if !launcher
        .sync_manager()
        .register_stream_loader(&stream, Arc::clone(&loader))?
    {
        debug!(stream = %stream, "stream failed before its loader opened");
        return Ok(());
    }
    loader.start().await?;
    info!(stream = %stream, "stream loader started");
    launcher.handle_open_stream_complete(&stream);
    Ok(())
}
