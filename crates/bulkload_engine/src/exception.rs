//! Failure routing for launched tasks.
//!
//! Every task goes through [`TaskExceptionHandler::wrap`] before it is
//! spawned. Errors never escape a wrapped task: a stream-level failure turns
//! into one `FailStream` task for that stream, a sync-level failure into one
//! `FailSync` task for the sync.
//!
//! ## Key invariants
//!
//! - a stream is remediated at most once; the first failure marks the stream
//!   failed and wins, later failures are only logged
//! - `FailSync` is launched at most once per sync, whether the sync failed
//!   directly or because every stream failed
//! - the failure callback runs at most once

use crate::error::{SharedError, SyncError};
use crate::launcher::TaskLauncher;
use crate::stream_manager::StreamResult;
use crate::sync_manager::SyncManager;
use crate::task::{Task, TaskKind, TaskLevel, TaskScope, WrappedTask};
use crate::tasks::TaskFactory;
use bulkload_protocol::StreamDescriptor;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Callback notified when sync failure remediation runs.
pub type FailureCallback = Box<dyn FnOnce(&SharedError) + Send>;

/// Converts task failures into remediation tasks.
pub struct TaskExceptionHandler {
    sync_manager: Arc<SyncManager>,
    factory: Arc<dyn TaskFactory>,
    fail_sync_launched: AtomicBool,
    callback: Mutex<Option<FailureCallback>>,
}

impl TaskExceptionHandler {
    pub(crate) fn new(sync_manager: Arc<SyncManager>, factory: Arc<dyn TaskFactory>) -> Self {
        Self {
            sync_manager,
            factory,
            fail_sync_launched: AtomicBool::new(false),
            callback: Mutex::new(None),
        }
    }

    /// Sets the callback invoked when the sync fails. Replaces any previous
    /// callback that has not run yet.
    pub fn set_callback(&self, callback: impl FnOnce(&SharedError) + Send + 'static) {
        *self.callback.lock() = Some(Box::new(callback));
    }

    /// Returns true once `FailSync` was launched.
    pub fn fail_sync_launched(&self) -> bool {
        self.fail_sync_launched.load(Ordering::Acquire)
    }

    /// Wraps a task so that its failures are routed to remediation.
    pub fn wrap(self: &Arc<Self>, launcher: &Arc<TaskLauncher>, task: Task) -> WrappedTask {
        let Task {
            kind,
            level,
            termination,
            scope,
            body,
        } = task;

        match (scope, level.clone()) {
            (TaskScope::Internal, _) => WrappedTask::new(kind, level, termination, async move {
                if let Err(err) = body.await {
                    error!(task = %kind, error = %err, "internal task failed");
                }
            }),
            (TaskScope::Implementor, TaskLevel::Sync) => {
                let handler = Arc::clone(self);
                let launcher = Arc::clone(launcher);
                WrappedTask::new(kind, level, termination, async move {
                    if let Err(err) = body.await {
                        handler.handle_sync_failure(&launcher, kind, err);
                    }
                })
            }
            (TaskScope::Implementor, TaskLevel::Stream(stream)) => {
                let handler = Arc::clone(self);
                let launcher = Arc::clone(launcher);
                WrappedTask::new(kind, level, termination, async move {
                    let manager = match handler.sync_manager.stream_manager(&stream) {
                        Ok(manager) => manager,
                        Err(err) => {
                            handler.handle_sync_failure(&launcher, kind, err);
                            return;
                        }
                    };
                    if manager.is_failed() {
                        debug!(task = %kind, stream = %stream, "stream already failed, skipping task");
                        return;
                    }
                    let result = tokio::select! {
                        biased;
                        _ = manager.await_failed() => {
                            debug!(task = %kind, stream = %stream, "stream failed, task cancelled");
                            return;
                        }
                        result = body => result,
                    };
                    if let Err(err) = result {
                        handler.handle_stream_failure(&launcher, &stream, kind, err);
                    }
                })
            }
        }
    }

    /// Marks the stream failed and launches its `FailStream` task, unless
    /// the stream is already terminal.
    pub fn handle_stream_failure(
        self: &Arc<Self>,
        launcher: &Arc<TaskLauncher>,
        stream: &StreamDescriptor,
        kind: TaskKind,
        err: SyncError,
    ) {
        let manager = match self.sync_manager.stream_manager(stream) {
            Ok(manager) => manager,
            Err(unknown) => {
                self.handle_sync_failure(launcher, kind, unknown);
                return;
            }
        };
        if manager.is_terminal() {
            warn!(
                task = %kind,
                stream = %stream,
                status = ?manager.status(),
                error = %err,
                "failure on terminal stream ignored"
            );
            return;
        }

        let error: SharedError = Arc::new(err);
        match manager.mark_failed(Arc::clone(&error)) {
            Ok(true) => {}
            Ok(false) => {
                debug!(task = %kind, stream = %stream, error = %error, "stream failure already handled");
                return;
            }
            Err(illegal) => {
                warn!(task = %kind, stream = %stream, error = %illegal, "stream finished concurrently");
                return;
            }
        }

        let kill = !manager.end_of_stream_marked();
        error!(task = %kind, stream = %stream, error = %error, kill, "stream failed");
        let task = self.factory.fail_stream(launcher, stream.clone(), error, kill);
        launcher.launch(task);
    }

    /// Records a sync failure, launches `FailSync` once and notifies the
    /// launcher.
    pub fn handle_sync_failure(
        self: &Arc<Self>,
        launcher: &Arc<TaskLauncher>,
        kind: TaskKind,
        err: SyncError,
    ) {
        let error: SharedError = Arc::new(err);
        error!(task = %kind, error = %error, "sync-level task failed");
        self.sync_manager.mark_failed(Arc::clone(&error));
        let cause = self.sync_manager.failure().unwrap_or_else(|| Arc::clone(&error));
        self.launch_fail_sync_once(launcher, cause);
        launcher.handle_exception(kind, error);
    }

    /// Launches `FailSync` unless it already ran. Returns true if this call
    /// launched it.
    pub fn launch_fail_sync_once(&self, launcher: &Arc<TaskLauncher>, cause: SharedError) -> bool {
        if self
            .fail_sync_launched
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(error = %cause, "fail-sync already launched");
            return false;
        }
        let task = self.factory.fail_sync(launcher, cause);
        launcher.launch(task);
        true
    }

    /// Fails the sync once the last stream fails.
    pub(crate) fn on_stream_terminal(
        &self,
        launcher: &Arc<TaskLauncher>,
        stream: &StreamDescriptor,
        result: &StreamResult,
    ) {
        let StreamResult::Failed(last) = result else {
            return;
        };
        if !self.sync_manager.all_streams_failed() {
            return;
        }
        let error: SharedError = Arc::new(SyncError::AllStreamsFailed {
            last: Arc::clone(last),
        });
        if self.sync_manager.mark_failed(Arc::clone(&error)) {
            error!(stream = %stream, "every stream failed, failing sync");
            self.launch_fail_sync_once(launcher, error);
        }
    }

    /// Runs the failure callback. Called by `FailSync`.
    pub fn handle_sync_failed(&self, error: &SharedError) {
        let callback = self.callback.lock().take();
        match callback {
            Some(callback) => callback(error),
            None => debug!(error = %error, "no failure callback registered"),
        }
    }
}
