use crate::destination::{Destination, OutputConsumer};
use crate::error::{SyncError, SyncResult};
use crate::launcher::TaskLauncher;
use crate::stream_manager::StreamStatus;
use std::sync::Arc;
use tracing::{info, warn};

pub(super) async fn run(
    launcher: Arc<TaskLauncher>,
    destination: Arc<dyn Destination>,
    output: Arc<dyn OutputConsumer>,
) -> SyncResult<()> {
    let sync = launcher.sync_manager();
    let flushed = if sync.is_failed() {
        Ok(())
    } else {
        flush_remaining(&launcher, output.as_ref()).await
    };

    let succeeded = flushed.is_ok() && !sync.is_failed();
    destination.teardown(succeeded).await?;
    flushed?;
    info!(succeeded, "destination teardown complete");
    launcher.handle_teardown_complete();
    Ok(())
}

async fn flush_remaining(launcher: &TaskLauncher, output: &dyn OutputConsumer) -> SyncResult<()> {
    let checkpoints = launcher.checkpoints();
    checkpoints.await_input_drained().await;
    checkpoints.flush_ready(output)?;

    let remaining = checkpoints.pending_count();
    if remaining == 0 {
        return Ok(());
    }
    let all_succeeded = launcher
        .sync_manager()
        .stream_managers()
        .all(|manager| manager.status() == StreamStatus::Succeeded);
    if all_succeeded {
        return Err(SyncError::illegal_state(format!(
            "{remaining} checkpoint(s) left unflushed after every stream succeeded"
        )));
    }
    warn!(remaining, "dropping checkpoints of failed streams");
    Ok(())
}
