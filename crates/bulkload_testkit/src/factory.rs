//! Task factory decorator for asserting on launched work.

use bulkload_engine::{SharedError, Task, TaskFactory, TaskKind, TaskLauncher};
use bulkload_protocol::StreamDescriptor;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// A `fail_stream` request seen by [`RecordingTaskFactory`].
#[derive(Debug, Clone)]
pub struct FailStreamRequest {
    /// The failed stream.
    pub stream: StreamDescriptor,
    /// The failure.
    pub error: SharedError,
    /// Whether the stream was killed before end-of-stream.
    pub kill: bool,
}

/// Wraps another factory and counts the tasks it builds.
pub struct RecordingTaskFactory {
    inner: Arc<dyn TaskFactory>,
    built: Mutex<HashMap<TaskKind, usize>>,
    fail_streams: Mutex<Vec<FailStreamRequest>>,
    fail_syncs: Mutex<Vec<SharedError>>,
}

impl RecordingTaskFactory {
    /// Decorates `inner`.
    pub fn new(inner: Arc<dyn TaskFactory>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            built: Mutex::new(HashMap::new()),
            fail_streams: Mutex::new(Vec::new()),
            fail_syncs: Mutex::new(Vec::new()),
        })
    }

    /// Number of tasks of `kind` built so far.
    pub fn count(&self, kind: TaskKind) -> usize {
        self.built.lock().get(&kind).copied().unwrap_or(0)
    }

    /// Every `fail_stream` request, in order.
    pub fn fail_stream_requests(&self) -> Vec<FailStreamRequest> {
        self.fail_streams.lock().clone()
    }

    /// Causes passed to `fail_sync`, in order.
    pub fn fail_sync_requests(&self) -> Vec<SharedError> {
        self.fail_syncs.lock().clone()
    }

    fn note(&self, kind: TaskKind) {
        *self.built.lock().entry(kind).or_insert(0) += 1;
    }
}

impl TaskFactory for RecordingTaskFactory {
    fn setup(&self, launcher: &Arc<TaskLauncher>) -> Task {
        self.note(TaskKind::Setup);
        self.inner.setup(launcher)
    }

    fn open_stream(&self, launcher: &Arc<TaskLauncher>, stream: StreamDescriptor) -> Task {
        self.note(TaskKind::OpenStream);
        self.inner.open_stream(launcher, stream)
    }

    fn input_consumer(&self, launcher: &Arc<TaskLauncher>) -> Task {
        self.note(TaskKind::InputConsumer);
        self.inner.input_consumer(launcher)
    }

    fn spill_to_disk(&self, launcher: &Arc<TaskLauncher>) -> Task {
        self.note(TaskKind::SpillToDisk);
        self.inner.spill_to_disk(launcher)
    }

    fn process_records(&self, launcher: &Arc<TaskLauncher>, stream: StreamDescriptor) -> Task {
        self.note(TaskKind::ProcessRecords);
        self.inner.process_records(launcher, stream)
    }

    fn process_file(&self, launcher: &Arc<TaskLauncher>, stream: StreamDescriptor) -> Task {
        self.note(TaskKind::ProcessFile);
        self.inner.process_file(launcher, stream)
    }

    fn process_batch(&self, launcher: &Arc<TaskLauncher>) -> Task {
        self.note(TaskKind::ProcessBatch);
        self.inner.process_batch(launcher)
    }

    fn close_stream(&self, launcher: &Arc<TaskLauncher>, stream: StreamDescriptor) -> Task {
        self.note(TaskKind::CloseStream);
        self.inner.close_stream(launcher, stream)
    }

    fn teardown(&self, launcher: &Arc<TaskLauncher>) -> Task {
        self.note(TaskKind::Teardown);
        self.inner.teardown(launcher)
    }

    fn fail_stream(
        &self,
        launcher: &Arc<TaskLauncher>,
        stream: StreamDescriptor,
        error: SharedError,
        kill: bool,
    ) -> Task {
        self.note(TaskKind::FailStream);
        self.fail_streams.lock().push(FailStreamRequest {
            stream: stream.clone(),
            error: Arc::clone(&error),
            kill,
        });
        self.inner.fail_stream(launcher, stream, error, kill)
    }

    fn fail_sync(&self, launcher: &Arc<TaskLauncher>, error: SharedError) -> Task {
        self.note(TaskKind::FailSync);
        self.fail_syncs.lock().push(Arc::clone(&error));
        self.inner.fail_sync(launcher, error)
    }

    fn update_checkpoints(&self, launcher: &Arc<TaskLauncher>) -> Task {
        self.note(TaskKind::UpdateCheckpoints);
        self.inner.update_checkpoints(launcher)
    }

    fn flush_checkpoints(&self, launcher: &Arc<TaskLauncher>) -> Task {
        self.note(TaskKind::FlushCheckpoints);
        self.inner.flush_checkpoints(launcher)
    }
}
