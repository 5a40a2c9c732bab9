//! The shared batch task.
//!
//! One task serves batches of every stream, so unlike other task bodies it
//! handles its own errors: a batch that cannot be advanced is reported
//! through [`TaskExceptionHandler::handle_stream_failure`] for its stream and
//! the task keeps serving the queue. Letting the error escape would end the
//! task and fail the sync for every stream.
//!
//! [`TaskExceptionHandler::handle_stream_failure`]: crate::TaskExceptionHandler::handle_stream_failure

use crate::batch::BatchEnvelope;
use crate::error::{SyncError, SyncResult};
use crate::launcher::TaskLauncher;
use crate::task::TaskKind;
use std::sync::Arc;
use tracing::trace;

/// Serves the batch queue until the scope is closed. A failure while
/// advancing a batch fails only that batch's stream.
pub(super) async fn run(launcher: Arc<TaskLauncher>) -> SyncResult<()> {
    let mut rx = launcher.queues().take_batch_receiver()?;
    while let Some(envelope) = rx.recv().await {
        let stream = envelope.stream.clone();
        if let Err(err) = advance(&launcher, envelope).await {
            launcher.exception_handler().handle_stream_failure(
                &launcher,
                &stream,
                TaskKind::ProcessBatch,
                err,
            );
        }
    }
    Err(SyncError::QueueClosed("batch"))
}

async fn advance(launcher: &Arc<TaskLauncher>, mut envelope: BatchEnvelope) -> SyncResult<()> {
    let sync = launcher.sync_manager();
    if sync.stream_manager(&envelope.stream)?.is_failed() {
        trace!(stream = %envelope.stream, batch = %envelope.batch.id, "skipping batch of failed stream");
        return Ok(());
    }
    let loader = sync.get_or_await_stream_loader(&envelope.stream).await?;
    while !envelope.batch.is_complete() {
        let previous = envelope.batch.state;
        let next = loader.process_batch(envelope.batch.clone()).await?;
        if next.id != envelope.batch.id || next.state <= previous {
            return Err(SyncError::illegal_state(format!(
                "loader for {} did not advance batch {} past {:?}",
                envelope.stream, envelope.batch.id, previous
            )));
        }
        trace!(stream = %envelope.stream, batch = %next.id, state = ?next.state, "batch advanced");
        envelope = envelope.with_batch(next);
        launcher.handle_new_batch(envelope.clone())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{Batch, BatchState};
    use crate::config::EngineConfig;
    use crate::testing::{self, RecordingLoader, StubFactory};
    use crate::task::Task;
    use bulkload_protocol::{DestinationCatalog, StreamDescriptor};

    fn streams() -> Vec<StreamDescriptor> {
        ["orders", "users", "events"]
            .iter()
            .map(|name| StreamDescriptor::new("shop", *name))
            .collect()
    }

    fn launcher() -> (Arc<TaskLauncher>, Arc<StubFactory>) {
        let factory = Arc::new(StubFactory::default());
        let catalog = DestinationCatalog::new(streams()).unwrap();
        let launcher = TaskLauncher::new(EngineConfig::default(), catalog, factory.clone()).unwrap();
        (launcher, factory)
    }

    fn process_batch_task(launcher: &Arc<TaskLauncher>) -> Task {
        Task::sync(TaskKind::ProcessBatch, run(Arc::clone(launcher))).run_until_signalled()
    }

    #[tokio::test]
    async fn staged_batches_complete_for_every_stream() {
        let (launcher, factory) = launcher();
        let mut loaders = Vec::new();
        let mut batches = Vec::new();
        for stream in streams() {
            let loader = Arc::new(RecordingLoader::default());
            launcher
                .sync_manager()
                .register_stream_loader(&stream, loader.clone())
                .unwrap();
            let manager = launcher.sync_manager().stream_manager(&stream).unwrap();
            manager.count_incoming_record(1).unwrap();
            let envelope = BatchEnvelope::new(stream.clone(), 0..1, Batch::staged(format!("{stream}/part-0")));
            launcher.handle_new_batch(envelope.clone()).unwrap();
            launcher.queues().batch_sender().send(envelope.clone()).await.unwrap();
            loaders.push(loader);
            batches.push(envelope);
        }

        launcher.launch(process_batch_task(&launcher));
        testing::settle().await;

        for (loader, envelope) in loaders.iter().zip(&batches) {
            assert_eq!(loader.batch_states(), vec![BatchState::Staged]);
            let manager = launcher.sync_manager().stream_manager(&envelope.stream).unwrap();
            assert_eq!(manager.batch_state(&envelope.batch.id), Some(BatchState::Complete));
        }
        assert_eq!(factory.count(TaskKind::FailStream), 0);
        launcher.scope().close().await;
    }

    #[tokio::test]
    async fn loader_error_fails_only_its_stream() {
        let (launcher, factory) = launcher();
        let all = streams();
        for (i, stream) in all.iter().enumerate() {
            let loader = Arc::new(RecordingLoader::default());
            if i == 0 {
                loader.fail_process_batch();
            }
            launcher
                .sync_manager()
                .register_stream_loader(stream, loader)
                .unwrap();
            launcher
                .sync_manager()
                .stream_manager(stream)
                .unwrap()
                .count_incoming_record(1)
                .unwrap();
            let envelope = BatchEnvelope::new(stream.clone(), 0..1, Batch::staged("part-0"));
            launcher.queues().batch_sender().send(envelope).await.unwrap();
        }

        launcher.launch(process_batch_task(&launcher));
        testing::settle().await;

        let fails = factory.fail_streams();
        assert_eq!(fails.len(), 1);
        assert_eq!(fails[0].stream, all[0]);
        assert!(!launcher.sync_manager().is_failed());
        launcher.scope().close().await;
    }

    #[tokio::test]
    async fn batch_that_does_not_advance_is_illegal() {
        let (launcher, factory) = launcher();
        let stream = streams().remove(1);
        let loader = Arc::new(RecordingLoader::default());
        loader.stall_process_batch();
        launcher
            .sync_manager()
            .register_stream_loader(&stream, loader)
            .unwrap();
        launcher
            .sync_manager()
            .stream_manager(&stream)
            .unwrap()
            .count_incoming_record(1)
            .unwrap();
        let envelope = BatchEnvelope::new(stream.clone(), 0..1, Batch::staged("part-0"));

        let err = advance(&launcher, envelope).await.unwrap_err();
        assert!(err.is_illegal_state());
        assert_eq!(factory.count(TaskKind::FailStream), 0);
    }
}
