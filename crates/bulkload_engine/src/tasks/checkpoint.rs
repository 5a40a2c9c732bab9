use crate::destination::OutputConsumer;
use crate::error::SyncResult;
use crate::launcher::TaskLauncher;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// Drains the checkpoint queue into the checkpoint manager until the input
/// side closes it.
pub(super) async fn update(launcher: Arc<TaskLauncher>) -> SyncResult<()> {
    let checkpoints = launcher.checkpoints();
    let drained = drain_into_manager(&launcher).await;
    // Teardown waits on this even when the queue could not be drained.
    checkpoints.mark_input_drained();
    debug!(pending = checkpoints.pending_count(), "checkpoint input drained");
    drained
}

async fn drain_into_manager(launcher: &TaskLauncher) -> SyncResult<()> {
    let mut rx = launcher.queues().take_checkpoint_receiver()?;
    while let Some(checkpoint) = rx.recv().await {
        launcher.checkpoints().add(checkpoint)?;
    }
    Ok(())
}

pub(super) async fn flush(launcher: Arc<TaskLauncher>, output: Arc<dyn OutputConsumer>) -> SyncResult<()> {
    let mut ticker = tokio::time::interval(launcher.config().checkpoint_flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        launcher.checkpoints().flush_ready(output.as_ref())?;
    }
}
