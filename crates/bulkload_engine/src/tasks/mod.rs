//! Task factories and the default pipeline tasks.
//!
//! The launcher never builds tasks itself; it asks a [`TaskFactory`]. The
//! [`DefaultTaskFactory`] wires the standard tasks to a connector's
//! [`Destination`], the process's [`InputFlow`] and its [`OutputConsumer`].

mod checkpoint;
mod close_stream;
mod fail;
mod input;
mod open_stream;
mod process_batch;
mod process_file;
mod process_records;
mod setup;
mod spill;
mod teardown;

use crate::destination::{Destination, InputFlow, OutputConsumer};
use crate::error::{SharedError, SyncError};
use crate::launcher::TaskLauncher;
use crate::task::{Task, TaskKind};
use bulkload_protocol::StreamDescriptor;
use parking_lot::Mutex;
use std::sync::Arc;

/// Builds the tasks the launcher runs.
///
/// Every constructor receives the launcher so the task can report progress
/// through its `handle_*` hooks.
pub trait TaskFactory: Send + Sync {
    /// Destination setup.
    fn setup(&self, launcher: &Arc<TaskLauncher>) -> Task;

    /// Opens one stream's loader.
    fn open_stream(&self, launcher: &Arc<TaskLauncher>, stream: StreamDescriptor) -> Task;

    /// Reads the input flow.
    fn input_consumer(&self, launcher: &Arc<TaskLauncher>) -> Task;

    /// Stages records to disk. Not used in file-transfer mode.
    fn spill_to_disk(&self, launcher: &Arc<TaskLauncher>) -> Task;

    /// Turns one stream's spilled records into batches.
    fn process_records(&self, launcher: &Arc<TaskLauncher>, stream: StreamDescriptor) -> Task;

    /// Transfers one stream's files.
    fn process_file(&self, launcher: &Arc<TaskLauncher>, stream: StreamDescriptor) -> Task;

    /// Advances staged batches to completion.
    fn process_batch(&self, launcher: &Arc<TaskLauncher>) -> Task;

    /// Closes a finished stream.
    fn close_stream(&self, launcher: &Arc<TaskLauncher>, stream: StreamDescriptor) -> Task;

    /// Destination teardown.
    fn teardown(&self, launcher: &Arc<TaskLauncher>) -> Task;

    /// Releases a failed stream. `kill` is set when the stream failed before
    /// end-of-stream.
    fn fail_stream(
        &self,
        launcher: &Arc<TaskLauncher>,
        stream: StreamDescriptor,
        error: SharedError,
        kill: bool,
    ) -> Task;

    /// Sync failure remediation.
    fn fail_sync(&self, launcher: &Arc<TaskLauncher>, error: SharedError) -> Task;

    /// Moves queued checkpoints into the checkpoint manager.
    fn update_checkpoints(&self, launcher: &Arc<TaskLauncher>) -> Task;

    /// Periodically emits durable checkpoints.
    fn flush_checkpoints(&self, launcher: &Arc<TaskLauncher>) -> Task;
}

/// The standard pipeline.
pub struct DefaultTaskFactory {
    destination: Arc<dyn Destination>,
    input: Mutex<Option<Box<dyn InputFlow>>>,
    output: Arc<dyn OutputConsumer>,
}

impl DefaultTaskFactory {
    /// Creates a factory for one sync.
    pub fn new(
        destination: Arc<dyn Destination>,
        input: impl InputFlow + 'static,
        output: Arc<dyn OutputConsumer>,
    ) -> Self {
        Self {
            destination,
            input: Mutex::new(Some(Box::new(input))),
            output,
        }
    }
}

impl TaskFactory for DefaultTaskFactory {
    fn setup(&self, launcher: &Arc<TaskLauncher>) -> Task {
        Task::sync(
            TaskKind::Setup,
            setup::run(Arc::clone(launcher), Arc::clone(&self.destination)),
        )
    }

    fn open_stream(&self, launcher: &Arc<TaskLauncher>, stream: StreamDescriptor) -> Task {
        Task::stream(
            TaskKind::OpenStream,
            stream.clone(),
            open_stream::run(Arc::clone(launcher), Arc::clone(&self.destination), stream),
        )
    }

    fn input_consumer(&self, launcher: &Arc<TaskLauncher>) -> Task {
        let input = self.input.lock().take();
        let launcher = Arc::clone(launcher);
        Task::sync(TaskKind::InputConsumer, async move {
            let input = input.ok_or_else(|| SyncError::illegal_state("input flow already consumed"))?;
            input::run(launcher, input).await
        })
    }

    fn spill_to_disk(&self, launcher: &Arc<TaskLauncher>) -> Task {
        Task::sync(TaskKind::SpillToDisk, spill::run(Arc::clone(launcher)))
    }

    fn process_records(&self, launcher: &Arc<TaskLauncher>, stream: StreamDescriptor) -> Task {
        Task::stream(
            TaskKind::ProcessRecords,
            stream.clone(),
            process_records::run(Arc::clone(launcher), stream),
        )
    }

    fn process_file(&self, launcher: &Arc<TaskLauncher>, stream: StreamDescriptor) -> Task {
        Task::stream(
            TaskKind::ProcessFile,
            stream.clone(),
            process_file::run(Arc::clone(launcher), stream),
        )
    }

    fn process_batch(&self, launcher: &Arc<TaskLauncher>) -> Task {
        Task::sync(TaskKind::ProcessBatch, process_batch::run(Arc::clone(launcher)))
            .run_until_signalled()
    }

    fn close_stream(&self, launcher: &Arc<TaskLauncher>, stream: StreamDescriptor) -> Task {
        Task::stream(
            TaskKind::CloseStream,
            stream.clone(),
            close_stream::run(Arc::clone(launcher), stream),
        )
    }

    fn teardown(&self, launcher: &Arc<TaskLauncher>) -> Task {
        Task::sync(
            TaskKind::Teardown,
            teardown::run(
                Arc::clone(launcher),
                Arc::clone(&self.destination),
                Arc::clone(&self.output),
            ),
        )
    }

    fn fail_stream(
        &self,
        launcher: &Arc<TaskLauncher>,
        stream: StreamDescriptor,
        error: SharedError,
        kill: bool,
    ) -> Task {
        Task::stream(
            TaskKind::FailStream,
            stream.clone(),
            fail::fail_stream(Arc::clone(launcher), stream, error, kill),
        )
        .internal()
    }

    fn fail_sync(&self, launcher: &Arc<TaskLauncher>, error: SharedError) -> Task {
        Task::sync(TaskKind::FailSync, fail::fail_sync(Arc::clone(launcher), error)).internal()
    }

    fn update_checkpoints(&self, launcher: &Arc<TaskLauncher>) -> Task {
        Task::sync(
            TaskKind::UpdateCheckpoints,
            checkpoint::update(Arc::clone(launcher)),
        )
    }

    fn flush_checkpoints(&self, launcher: &Arc<TaskLauncher>) -> Task {
        Task::sync(
            TaskKind::FlushCheckpoints,
            checkpoint::flush(Arc::clone(launcher), Arc::clone(&self.output)),
        )
        .run_until_signalled()
    }
}
