//! Test doubles for unit tests inside the engine.

use crate::batch::{Batch, BatchState};
use crate::destination::StreamLoader;
use crate::error::{SharedError, SyncError, SyncResult};
use crate::launcher::TaskLauncher;
use crate::task::{Task, TaskKind};
use crate::tasks::TaskFactory;
use async_trait::async_trait;
use bulkload_protocol::{DestinationRecord, StreamDescriptor};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Gives spawned tasks time to run.
pub(crate) async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[derive(Debug, Clone)]
pub(crate) struct FailStreamCall {
    pub stream: StreamDescriptor,
    pub error: SharedError,
    pub kill: bool,
}

/// Factory whose tasks do nothing but record that they ran. Remediation
/// tasks report completion so the launcher's bookkeeping advances.
#[derive(Default)]
pub(crate) struct StubFactory {
    built: Mutex<Vec<TaskKind>>,
    ran: Arc<Mutex<Vec<TaskKind>>>,
    fail_streams: Mutex<Vec<FailStreamCall>>,
}

impl StubFactory {
    pub(crate) fn count(&self, kind: TaskKind) -> usize {
        self.built.lock().iter().filter(|k| **k == kind).count()
    }

    pub(crate) fn ran(&self, kind: TaskKind) -> bool {
        self.ran.lock().contains(&kind)
    }

    pub(crate) fn fail_streams(&self) -> Vec<FailStreamCall> {
        self.fail_streams.lock().clone()
    }

    fn noop_sync(&self, kind: TaskKind) -> Task {
        self.built.lock().push(kind);
        let ran = Arc::clone(&self.ran);
        Task::sync(kind, async move {
            ran.lock().push(kind);
            Ok(())
        })
    }

    fn noop_stream(&self, kind: TaskKind, stream: StreamDescriptor) -> Task {
        self.built.lock().push(kind);
        let ran = Arc::clone(&self.ran);
        Task::stream(kind, stream, async move {
            ran.lock().push(kind);
            Ok(())
        })
    }
}

impl TaskFactory for StubFactory {
    fn setup(&self, _launcher: &Arc<TaskLauncher>) -> Task {
        self.noop_sync(TaskKind::Setup)
    }

    fn open_stream(&self, _launcher: &Arc<TaskLauncher>, stream: StreamDescriptor) -> Task {
        self.noop_stream(TaskKind::OpenStream, stream)
    }

    fn input_consumer(&self, _launcher: &Arc<TaskLauncher>) -> Task {
        self.noop_sync(TaskKind::InputConsumer)
    }

    fn spill_to_disk(&self, _launcher: &Arc<TaskLauncher>) -> Task {
        self.noop_sync(TaskKind::SpillToDisk)
    }

    fn process_records(&self, _launcher: &Arc<TaskLauncher>, stream: StreamDescriptor) -> Task {
        self.noop_stream(TaskKind::ProcessRecords, stream)
    }

    fn process_file(&self, _launcher: &Arc<TaskLauncher>, stream: StreamDescriptor) -> Task {
        self.noop_stream(TaskKind::ProcessFile, stream)
    }

    fn process_batch(&self, _launcher: &Arc<TaskLauncher>) -> Task {
        self.noop_sync(TaskKind::ProcessBatch).run_until_signalled()
    }

    fn close_stream(&self, _launcher: &Arc<TaskLauncher>, stream: StreamDescriptor) -> Task {
        self.noop_stream(TaskKind::CloseStream, stream)
    }

    fn teardown(&self, _launcher: &Arc<TaskLauncher>) -> Task {
        self.noop_sync(TaskKind::Teardown)
    }

    fn fail_stream(
        &self,
        launcher: &Arc<TaskLauncher>,
        stream: StreamDescriptor,
        error: SharedError,
        kill: bool,
    ) -> Task {
        self.built.lock().push(TaskKind::FailStream);
        self.fail_streams.lock().push(FailStreamCall {
            stream: stream.clone(),
            error: Arc::clone(&error),
            kill,
        });
        let launcher = Arc::clone(launcher);
        Task::stream(TaskKind::FailStream, stream.clone(), async move {
            launcher.handle_fail_stream_complete(&stream, &error);
            Ok(())
        })
        .internal()
    }

    fn fail_sync(&self, launcher: &Arc<TaskLauncher>, error: SharedError) -> Task {
        self.built.lock().push(TaskKind::FailSync);
        let launcher = Arc::clone(launcher);
        Task::sync(TaskKind::FailSync, async move {
            launcher.exception_handler().handle_sync_failed(&error);
            launcher.handle_fail_sync_complete(Vec::new());
            Ok(())
        })
        .internal()
    }

    fn update_checkpoints(&self, _launcher: &Arc<TaskLauncher>) -> Task {
        self.noop_sync(TaskKind::UpdateCheckpoints)
    }

    fn flush_checkpoints(&self, _launcher: &Arc<TaskLauncher>) -> Task {
        self.noop_sync(TaskKind::FlushCheckpoints).run_until_signalled()
    }
}

/// Loader that records every call.
#[derive(Default)]
pub(crate) struct RecordingLoader {
    calls: Mutex<Vec<&'static str>>,
    batch_states: Mutex<Vec<BatchState>>,
    fail_process_batch: AtomicBool,
    stall_process_batch: AtomicBool,
}

impl RecordingLoader {
    pub(crate) fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }

    /// States of the batches passed to `process_batch`.
    pub(crate) fn batch_states(&self) -> Vec<BatchState> {
        self.batch_states.lock().clone()
    }

    pub(crate) fn fail_process_batch(&self) {
        self.fail_process_batch.store(true, Ordering::SeqCst);
    }

    pub(crate) fn stall_process_batch(&self) {
        self.stall_process_batch.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl StreamLoader for RecordingLoader {
    async fn process_records(&self, _records: Vec<DestinationRecord>) -> SyncResult<Batch> {
        self.calls.lock().push("process_records");
        Ok(Batch::complete())
    }

    async fn process_batch(&self, batch: Batch) -> SyncResult<Batch> {
        self.batch_states.lock().push(batch.state);
        if self.fail_process_batch.load(Ordering::SeqCst) {
            return Err(SyncError::destination("copy into table failed"));
        }
        if self.stall_process_batch.load(Ordering::SeqCst) {
            return Ok(batch);
        }
        Ok(batch.with_state(BatchState::Complete))
    }

    async fn close(&self, failure: Option<&SyncError>) -> SyncResult<()> {
        self.calls.lock().push(if failure.is_some() {
            "close_with_failure"
        } else {
            "close"
        });
        Ok(())
    }

    async fn abort(&self, _failure: &SyncError) -> SyncResult<()> {
        self.calls.lock().push("abort");
        Ok(())
    }
}
