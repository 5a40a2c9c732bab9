//! Task model.
//!
//! A [`Task`] is a unit of pipeline work: a boxed future plus the tags the
//! exception handler and scope provider dispatch on. Tasks are produced by a
//! [`TaskFactory`](crate::tasks::TaskFactory), wrapped by the
//! [`TaskExceptionHandler`](crate::exception::TaskExceptionHandler) and
//! spawned by the [`TaskScopeProvider`](crate::scope::TaskScopeProvider).

use crate::error::SyncResult;
use bulkload_protocol::StreamDescriptor;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

/// Pipeline role of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// Destination setup.
    Setup,
    /// Opens one stream's loader.
    OpenStream,
    /// Reads the input flow.
    InputConsumer,
    /// Stages records to local spill files.
    SpillToDisk,
    /// Turns spilled records into batches.
    ProcessRecords,
    /// Transfers whole files.
    ProcessFile,
    /// Advances staged batches to completion.
    ProcessBatch,
    /// Closes a finished stream.
    CloseStream,
    /// Destination teardown.
    Teardown,
    /// Stream failure remediation.
    FailStream,
    /// Sync failure remediation.
    FailSync,
    /// Moves checkpoints from the queue into the checkpoint manager.
    UpdateCheckpoints,
    /// Periodically emits durable checkpoints.
    FlushCheckpoints,
    /// A task outside the standard pipeline.
    Custom(&'static str),
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskKind::Setup => "setup",
            TaskKind::OpenStream => "open_stream",
            TaskKind::InputConsumer => "input_consumer",
            TaskKind::SpillToDisk => "spill_to_disk",
            TaskKind::ProcessRecords => "process_records",
            TaskKind::ProcessFile => "process_file",
            TaskKind::ProcessBatch => "process_batch",
            TaskKind::CloseStream => "close_stream",
            TaskKind::Teardown => "teardown",
            TaskKind::FailStream => "fail_stream",
            TaskKind::FailSync => "fail_sync",
            TaskKind::UpdateCheckpoints => "update_checkpoints",
            TaskKind::FlushCheckpoints => "flush_checkpoints",
            TaskKind::Custom(name) => name,
        };
        f.write_str(name)
    }
}

/// Whether a task belongs to one stream or to the whole sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskLevel {
    /// Work for a single stream; fails only that stream.
    Stream(StreamDescriptor),
    /// Sync-wide work; a failure fails the sync.
    Sync,
}

impl TaskLevel {
    /// The stream of a stream-level task.
    pub fn stream(&self) -> Option<&StreamDescriptor> {
        match self {
            TaskLevel::Stream(stream) => Some(stream),
            TaskLevel::Sync => None,
        }
    }
}

/// How a task ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Runs to completion on its own.
    SelfTerminating,
    /// Runs until the scope is closed.
    RunUntilSignalled,
}

/// Who supplies the task's logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskScope {
    /// Connector or pipeline logic; failures are converted into remediation.
    Implementor,
    /// Remediation logic; failures are only logged.
    Internal,
}

/// Boxed body of a task.
pub type TaskFuture = Pin<Box<dyn Future<Output = SyncResult<()>> + Send + 'static>>;

/// A unit of pipeline work.
pub struct Task {
    /// Pipeline role.
    pub kind: TaskKind,
    /// Stream or sync level.
    pub level: TaskLevel,
    /// Termination condition.
    pub termination: Termination,
    /// Exception handling scope.
    pub scope: TaskScope,
    pub(crate) body: TaskFuture,
}

impl Task {
    /// Creates a self-terminating implementor task for one stream.
    pub fn stream<F>(kind: TaskKind, stream: StreamDescriptor, body: F) -> Self
    where
        F: Future<Output = SyncResult<()>> + Send + 'static,
    {
        Self {
            kind,
            level: TaskLevel::Stream(stream),
            termination: Termination::SelfTerminating,
            scope: TaskScope::Implementor,
            body: Box::pin(body),
        }
    }

    /// Creates a self-terminating implementor task for the sync.
    pub fn sync<F>(kind: TaskKind, body: F) -> Self
    where
        F: Future<Output = SyncResult<()>> + Send + 'static,
    {
        Self {
            kind,
            level: TaskLevel::Sync,
            termination: Termination::SelfTerminating,
            scope: TaskScope::Implementor,
            body: Box::pin(body),
        }
    }

    /// Marks the task as running until the scope is closed.
    pub fn run_until_signalled(mut self) -> Self {
        self.termination = Termination::RunUntilSignalled;
        self
    }

    /// Marks the task as internal remediation.
    pub fn internal(mut self) -> Self {
        self.scope = TaskScope::Internal;
        self
    }

    /// Splits off the body, e.g. to run it directly in tests.
    pub fn into_body(self) -> TaskFuture {
        self.body
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("kind", &self.kind)
            .field("level", &self.level)
            .field("termination", &self.termination)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

/// A task whose failures are already routed to remediation, ready to spawn.
pub struct WrappedTask {
    /// Pipeline role.
    pub kind: TaskKind,
    /// Stream or sync level.
    pub level: TaskLevel,
    /// Termination condition.
    pub termination: Termination,
    future: Pin<Box<dyn Future<Output = ()> + Send + 'static>>,
}

impl WrappedTask {
    pub(crate) fn new<F>(kind: TaskKind, level: TaskLevel, termination: Termination, future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            kind,
            level,
            termination,
            future: Box::pin(future),
        }
    }

    /// The future to spawn.
    pub fn into_future(self) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>> {
        self.future
    }
}

impl fmt::Debug for WrappedTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WrappedTask")
            .field("kind", &self.kind)
            .field("level", &self.level)
            .field("termination", &self.termination)
            .finish_non_exhaustive()
    }
}
