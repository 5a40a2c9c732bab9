//! Pipeline conductor.
//!
//! The [`TaskLauncher`] is the orchestration root of one sync. It owns all
//! sync-wide state and sequences the pipeline through `handle_*` hooks that
//! running tasks call as they make progress:
//!
//! ```text
//! run ──► Setup ──► OpenStream (per stream) ──► ProcessRecords / ProcessFile
//!  ├────► InputConsumer                                 │
//!  ├────► SpillToDisk (staged mode)          handle_new_batch ──► CloseStream
//!  └────► ProcessBatch                                              │
//!                       every stream closed or failure-handled ◄────┘
//!                                     │
//!                                     ▼
//!                                 Teardown ──► outcome
//! ```
//!
//! Teardown always runs, also when every stream failed, and never while
//! `FailSync` is in flight.

use crate::batch::BatchEnvelope;
use crate::checkpoint::CheckpointManager;
use crate::config::EngineConfig;
use crate::error::{SharedError, SyncError, SyncResult};
use crate::exception::TaskExceptionHandler;
use crate::queue::PipelineQueues;
use crate::reservation::ReservationManager;
use crate::scope::TaskScopeProvider;
use crate::stream_manager::{StreamManager, StreamResult};
use crate::sync_manager::{SyncManager, SyncSummary};
use crate::task::{Task, TaskKind};
use crate::tasks::TaskFactory;
use bulkload_protocol::{DestinationCatalog, StreamDescriptor};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Terminal outcome of a sync.
#[derive(Debug, Clone)]
enum Outcome {
    Succeeded,
    Failed(SharedError),
}

#[derive(Default)]
struct LauncherState {
    started: bool,
    setup_complete: bool,
    opened: HashSet<StreamDescriptor>,
    close_launched: HashSet<StreamDescriptor>,
    closed: HashSet<StreamDescriptor>,
    fail_handled: HashSet<StreamDescriptor>,
    fail_sync_complete: bool,
    teardown_launched: bool,
    teardown_finished: bool,
    finished: bool,
}

/// Orchestration root of one sync.
pub struct TaskLauncher {
    config: EngineConfig,
    catalog: Arc<DestinationCatalog>,
    sync_manager: Arc<SyncManager>,
    scope: TaskScopeProvider,
    handler: Arc<TaskExceptionHandler>,
    factory: Arc<dyn TaskFactory>,
    queues: PipelineQueues,
    reservations: ReservationManager,
    checkpoints: CheckpointManager,
    state: Mutex<LauncherState>,
    outcome: watch::Sender<Option<Outcome>>,
}

impl TaskLauncher {
    /// Builds the launcher and all sync-wide state.
    pub fn new(
        config: EngineConfig,
        catalog: DestinationCatalog,
        factory: Arc<dyn TaskFactory>,
    ) -> SyncResult<Arc<Self>> {
        config.validate()?;
        let catalog = Arc::new(catalog);
        let sync_manager = Arc::new(SyncManager::new(Arc::clone(&catalog)));
        let handler = Arc::new(TaskExceptionHandler::new(
            Arc::clone(&sync_manager),
            Arc::clone(&factory),
        ));
        let queues = PipelineQueues::new(&config, &catalog);
        let reservations = ReservationManager::new(config.memory_budget_bytes);
        let checkpoints = CheckpointManager::new(Arc::clone(&sync_manager));
        let (outcome, _) = watch::channel(None);

        let launcher = Arc::new(Self {
            config,
            catalog,
            sync_manager,
            scope: TaskScopeProvider::new(),
            handler,
            factory,
            queues,
            reservations,
            checkpoints,
            state: Mutex::new(LauncherState::default()),
            outcome,
        });

        let weak = Arc::downgrade(&launcher);
        launcher
            .sync_manager
            .subscribe_stream_terminal(Arc::new(move |stream, result| {
                if let Some(launcher) = weak.upgrade() {
                    if matches!(result, StreamResult::Failed(_)) {
                        launcher.release_failed_stream(stream);
                    }
                    launcher.handler.on_stream_terminal(&launcher, stream, result);
                }
            }));
        Ok(launcher)
    }

    /// Runs the sync until it reaches a terminal state.
    ///
    /// Returns a summary when the sync succeeded, even if some streams
    /// failed individually, and [`SyncError::SyncFailed`] otherwise.
    pub async fn run(self: &Arc<Self>) -> SyncResult<SyncSummary> {
        self.start()?;
        match self.await_outcome().await {
            Outcome::Succeeded => {
                self.scope.close().await;
                let summary = self.sync_manager.summary();
                info!(
                    streams = summary.streams.len(),
                    failed = summary.failed_streams().count(),
                    "sync succeeded"
                );
                Ok(summary)
            }
            Outcome::Failed(cause) => {
                self.scope.kill().await;
                error!(error = %cause, "sync failed");
                Err(SyncError::SyncFailed(cause))
            }
        }
    }

    fn start(self: &Arc<Self>) -> SyncResult<()> {
        {
            let mut state = self.state.lock();
            if state.started {
                return Err(SyncError::illegal_state("sync already started"));
            }
            state.started = true;
        }
        info!(
            streams = self.catalog.len(),
            file_transfer = self.config.file_transfer,
            "starting sync"
        );
        self.launch(self.factory.setup(self));
        self.launch(self.factory.input_consumer(self));
        if !self.config.file_transfer {
            self.launch(self.factory.spill_to_disk(self));
        }
        self.launch(self.factory.process_batch(self));
        Ok(())
    }

    async fn await_outcome(&self) -> Outcome {
        let mut rx = self.outcome.subscribe();
        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|outcome| outcome.clone());
        outcome.unwrap_or_else(|| Outcome::Failed(Arc::new(SyncError::QueueClosed("sync outcome"))))
    }

    /// Wraps a task and spawns it.
    pub fn launch(self: &Arc<Self>, task: Task) -> bool {
        let wrapped = self.handler.wrap(self, task);
        self.scope.launch(wrapped)
    }

    /// Setup finished: start checkpointing and open every stream.
    pub fn handle_setup_complete(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.setup_complete {
                warn!("setup reported complete twice");
                return;
            }
            state.setup_complete = true;
        }
        debug!("setup complete");
        self.launch(self.factory.update_checkpoints(self));
        self.launch(self.factory.flush_checkpoints(self));
        for stream in self.catalog.streams() {
            self.launch(self.factory.open_stream(self, stream.clone()));
        }
        self.maybe_launch_teardown();
    }

    /// A stream's loader is open: start processing its input.
    pub fn handle_open_stream_complete(self: &Arc<Self>, stream: &StreamDescriptor) {
        if !self.state.lock().opened.insert(stream.clone()) {
            warn!(stream = %stream, "stream reported open twice");
            return;
        }
        debug!(stream = %stream, "stream open");
        let task = if self.config.file_transfer {
            self.factory.process_file(self, stream.clone())
        } else {
            self.factory.process_records(self, stream.clone())
        };
        self.launch(task);
    }

    /// Records a batch's progress and closes the stream once it is done.
    pub fn handle_new_batch(self: &Arc<Self>, envelope: BatchEnvelope) -> SyncResult<()> {
        let manager = self.sync_manager.stream_manager(&envelope.stream)?;
        if !manager.update_batch_state(&envelope)? {
            debug!(stream = %envelope.stream, batch = %envelope.batch.id, "batch for failed stream ignored");
            return Ok(());
        }
        self.maybe_close_stream(&manager);
        Ok(())
    }

    /// The stream's processing task consumed all of its input.
    pub fn handle_end_of_stream(self: &Arc<Self>, stream: &StreamDescriptor) -> SyncResult<()> {
        let manager = self.sync_manager.stream_manager(stream)?;
        self.maybe_close_stream(&manager);
        Ok(())
    }

    /// A stream closed successfully.
    pub fn handle_stream_closed(self: &Arc<Self>, stream: &StreamDescriptor) {
        self.state.lock().closed.insert(stream.clone());
        info!(stream = %stream, "stream closed");
        self.maybe_launch_teardown();
    }

    /// `FailStream` finished for a stream.
    pub fn handle_fail_stream_complete(self: &Arc<Self>, stream: &StreamDescriptor, error: &SharedError) {
        self.state.lock().fail_handled.insert(stream.clone());
        debug!(stream = %stream, error = %error, "stream failure handled");
        self.maybe_launch_teardown();
    }

    /// `FailSync` finished. `handled` lists the streams it failed itself.
    pub fn handle_fail_sync_complete(self: &Arc<Self>, handled: Vec<StreamDescriptor>) {
        {
            let mut state = self.state.lock();
            state.fail_sync_complete = true;
            state.fail_handled.extend(handled);
        }
        debug!("sync failure handled");
        self.maybe_launch_teardown();
        self.maybe_finish();
    }

    /// Teardown finished. Idempotent.
    pub fn handle_teardown_complete(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.teardown_finished {
                debug!("teardown already complete");
                return;
            }
            state.teardown_finished = true;
        }
        if let Some(cause) = self.sync_manager.failure() {
            if self.handler.launch_fail_sync_once(self, cause) {
                debug!("fail-sync launched after teardown");
            }
        }
        self.maybe_finish();
    }

    /// A sync-level task failed.
    pub fn handle_exception(self: &Arc<Self>, kind: TaskKind, error: SharedError) {
        warn!(task = %kind, error = %error, "sync-level exception");
        if kind == TaskKind::Teardown {
            self.state.lock().teardown_finished = true;
            self.maybe_finish();
        }
    }

    /// Frees memory held for a failed stream: its pending checkpoints and
    /// any input queued for a processing task that never took it.
    fn release_failed_stream(&self, stream: &StreamDescriptor) {
        let checkpoints = self.checkpoints.discard_stream(stream);
        let queued = self.queues.discard_stream_input(stream);
        debug!(stream = %stream, checkpoints, queued, "released failed stream");
    }

    fn maybe_close_stream(self: &Arc<Self>, manager: &StreamManager) {
        if !manager.is_batch_processing_complete() {
            return;
        }
        let stream = manager.stream();
        if !self.state.lock().close_launched.insert(stream.clone()) {
            return;
        }
        self.launch(self.factory.close_stream(self, stream.clone()));
    }

    fn fail_sync_in_flight(&self, state: &LauncherState) -> bool {
        self.handler.fail_sync_launched() && !state.fail_sync_complete
    }

    fn maybe_launch_teardown(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.teardown_launched || self.fail_sync_in_flight(&state) {
                return;
            }
            let accounted = self
                .catalog
                .streams()
                .iter()
                .all(|stream| state.closed.contains(stream) || state.fail_handled.contains(stream));
            if !accounted {
                return;
            }
            state.teardown_launched = true;
        }
        info!("every stream finished, tearing down");
        self.launch(self.factory.teardown(self));
    }

    fn maybe_finish(&self) {
        {
            let mut state = self.state.lock();
            if state.finished || !state.teardown_finished || self.fail_sync_in_flight(&state) {
                return;
            }
            state.finished = true;
        }
        let outcome = match self.sync_manager.failure() {
            Some(cause) => Outcome::Failed(cause),
            None => match self.sync_manager.mark_succeeded() {
                Ok(()) => Outcome::Succeeded,
                Err(err) => Outcome::Failed(
                    self.sync_manager
                        .failure()
                        .unwrap_or_else(|| Arc::new(err)),
                ),
            },
        };
        self.outcome.send_replace(Some(outcome));
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Configured catalog.
    pub fn catalog(&self) -> &Arc<DestinationCatalog> {
        &self.catalog
    }

    /// Sync-wide state.
    pub fn sync_manager(&self) -> &Arc<SyncManager> {
        &self.sync_manager
    }

    /// Exception handler; register the failure callback here.
    pub fn exception_handler(&self) -> &Arc<TaskExceptionHandler> {
        &self.handler
    }

    /// Pipeline queues.
    pub fn queues(&self) -> &PipelineQueues {
        &self.queues
    }

    /// Memory reservations.
    pub fn reservations(&self) -> &ReservationManager {
        &self.reservations
    }

    /// Checkpoint bookkeeping.
    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    /// Task scope.
    pub fn scope(&self) -> &TaskScopeProvider {
        &self.scope
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{Batch, BatchState};
    use crate::queue::StreamInput;
    use crate::stream_manager::StreamStatus;
    use crate::testing::{self, StubFactory};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn stream(name: &str) -> StreamDescriptor {
        StreamDescriptor::unnamespaced(name)
    }

    fn launcher(names: &[&str], config: EngineConfig) -> (Arc<TaskLauncher>, Arc<StubFactory>) {
        let factory = Arc::new(StubFactory::default());
        let catalog = DestinationCatalog::new(names.iter().map(|n| stream(n)).collect()).unwrap();
        let launcher = TaskLauncher::new(config, catalog, factory.clone()).unwrap();
        (launcher, factory)
    }

    fn failing(kind: TaskKind, name: &str, message: &'static str) -> Task {
        Task::stream(kind, stream(name), async move { Err(SyncError::destination(message)) })
    }

    #[tokio::test]
    async fn stream_failure_launches_one_fail_stream() {
        let (launcher, factory) = launcher(&["a", "b"], EngineConfig::default());
        launcher.launch(failing(TaskKind::ProcessRecords, "a", "first"));
        testing::settle().await;
        launcher.launch(failing(TaskKind::ProcessRecords, "a", "second"));
        testing::settle().await;

        let fails = factory.fail_streams();
        assert_eq!(fails.len(), 1);
        assert_eq!(fails[0].stream, stream("a"));
        assert_eq!(fails[0].error.to_string(), "destination error: first");
        assert!(fails[0].kill);
        assert_eq!(factory.count(TaskKind::FailSync), 0);
        assert!(!launcher.sync_manager().is_failed());
    }

    #[tokio::test]
    async fn fail_stream_after_end_of_stream_is_not_a_kill() {
        let (launcher, factory) = launcher(&["a", "b"], EngineConfig::default());
        let manager = launcher.sync_manager().stream_manager(&stream("a")).unwrap();
        manager.mark_end_of_stream().unwrap();
        launcher.launch(failing(TaskKind::CloseStream, "a", "close failed"));
        testing::settle().await;

        let fails = factory.fail_streams();
        assert_eq!(fails.len(), 1);
        assert!(!fails[0].kill);
    }

    #[tokio::test]
    async fn sync_failures_launch_one_fail_sync() {
        let (launcher, factory) = launcher(&["a"], EngineConfig::default());
        let callbacks = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&callbacks);
        launcher.exception_handler().set_callback(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        launcher.launch(failing(TaskKind::ProcessRecords, "a", "stream broke"));
        testing::settle().await;
        for message in ["setup broke", "input broke"] {
            launcher.launch(Task::sync(TaskKind::Custom("sync"), async move {
                Err(SyncError::destination(message))
            }));
        }
        testing::settle().await;

        assert_eq!(factory.count(TaskKind::FailSync), 1);
        assert_eq!(callbacks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn all_streams_failing_fails_sync_once() {
        let (launcher, factory) = launcher(&["a", "b", "c"], EngineConfig::default());
        for name in ["a", "b", "c"] {
            launcher.launch(failing(TaskKind::OpenStream, name, "unreachable"));
        }
        testing::settle().await;

        assert_eq!(factory.count(TaskKind::FailStream), 3);
        assert_eq!(factory.count(TaskKind::FailSync), 1);
        let failure = launcher.sync_manager().failure().unwrap();
        assert!(matches!(*failure, SyncError::AllStreamsFailed { .. }));
    }

    #[tokio::test]
    async fn failed_stream_skips_task_body() {
        let (launcher, _factory) = launcher(&["a"], EngineConfig::default());
        launcher
            .sync_manager()
            .stream_manager(&stream("a"))
            .unwrap()
            .mark_failed(Arc::new(SyncError::destination("earlier")))
            .unwrap();

        let (probe, mut rx) = mpsc::channel::<()>(1);
        launcher.launch(Task::stream(TaskKind::ProcessRecords, stream("a"), async move {
            let _ = probe.send(()).await;
            Ok(())
        }));
        let observed = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(!matches!(observed, Ok(Some(()))));
    }

    #[tokio::test]
    async fn running_task_cancelled_when_stream_fails() {
        let (launcher, factory) = launcher(&["a", "b"], EngineConfig::default());
        launcher.launch(Task::stream(TaskKind::ProcessRecords, stream("a"), async {
            std::future::pending::<()>().await;
            Ok(())
        }));
        testing::settle().await;
        assert_eq!(launcher.scope().in_flight(), 1);

        launcher.launch(failing(TaskKind::OpenStream, "a", "boom"));
        testing::settle().await;
        assert_eq!(factory.count(TaskKind::FailStream), 1);
        assert_eq!(launcher.scope().in_flight(), 0);
    }

    #[tokio::test]
    async fn failure_on_terminal_stream_is_only_logged() {
        let (launcher, factory) = launcher(&["a", "b", "c"], EngineConfig::default());
        let callbacks = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&callbacks);
        launcher.exception_handler().set_callback(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let sync = launcher.sync_manager();
        let succeeded = sync.stream_manager(&stream("a")).unwrap();
        succeeded.mark_end_of_stream().unwrap();
        succeeded.mark_succeeded().unwrap();
        sync.stream_manager(&stream("b"))
            .unwrap()
            .mark_failed(Arc::new(SyncError::destination("earlier")))
            .unwrap();

        for name in ["a", "b"] {
            launcher.exception_handler().handle_stream_failure(
                &launcher,
                &stream(name),
                TaskKind::CloseStream,
                SyncError::destination("late"),
            );
        }
        testing::settle().await;

        assert_eq!(factory.count(TaskKind::FailStream), 0);
        assert_eq!(factory.count(TaskKind::FailSync), 0);
        assert_eq!(callbacks.load(Ordering::SeqCst), 0);
        assert!(!sync.is_failed());
        assert_eq!(succeeded.status(), StreamStatus::Succeeded);
    }

    #[tokio::test]
    async fn stream_failure_closes_its_unclaimed_input() {
        let (launcher, _factory) = launcher(&["a", "b"], EngineConfig::default());
        let mut senders = launcher.queues().take_stream_senders().unwrap();
        let a = senders.remove(&stream("a")).unwrap();
        let b = senders.remove(&stream("b")).unwrap();
        a.send(StreamInput::EndOfStream).await.unwrap();

        launcher.launch(failing(TaskKind::OpenStream, "a", "boom"));
        testing::settle().await;

        assert!(a.is_closed());
        assert!(!b.is_closed());
        assert!(launcher.queues().take_stream_receiver(&stream("b")).is_ok());
    }

    #[tokio::test]
    async fn closing_every_stream_launches_teardown() {
        let (launcher, factory) = launcher(&["a", "b"], EngineConfig::default());
        launcher.handle_stream_closed(&stream("a"));
        assert_eq!(factory.count(TaskKind::Teardown), 0);
        launcher.handle_stream_closed(&stream("b"));
        launcher.handle_stream_closed(&stream("b"));
        assert_eq!(factory.count(TaskKind::Teardown), 1);
    }

    #[tokio::test]
    async fn teardown_runs_when_every_stream_failed() {
        let (launcher, factory) = launcher(&["a", "b"], EngineConfig::default());
        for name in ["a", "b"] {
            launcher.launch(failing(TaskKind::ProcessRecords, name, "boom"));
        }
        testing::settle().await;
        assert_eq!(factory.count(TaskKind::Teardown), 1);
    }

    #[tokio::test]
    async fn teardown_complete_twice_does_not_rerun_fail_sync() {
        let (launcher, factory) = launcher(&["a"], EngineConfig::default());
        launcher.launch(Task::sync(TaskKind::Custom("sync"), async {
            Err(SyncError::destination("boom"))
        }));
        testing::settle().await;
        assert_eq!(factory.count(TaskKind::FailSync), 1);

        launcher.handle_teardown_complete();
        launcher.handle_teardown_complete();
        testing::settle().await;
        assert_eq!(factory.count(TaskKind::FailSync), 1);
        assert!(matches!(launcher.await_outcome().await, Outcome::Failed(_)));
    }

    #[tokio::test]
    async fn teardown_complete_resolves_success() {
        let (launcher, _factory) = launcher(&[], EngineConfig::default());
        launcher.handle_teardown_complete();
        assert!(matches!(launcher.await_outcome().await, Outcome::Succeeded));
    }

    #[tokio::test]
    async fn file_transfer_skips_spill_task() {
        let (launcher, factory) = launcher(&["a"], EngineConfig::new().with_file_transfer(true));
        launcher.start().unwrap();
        assert_eq!(factory.count(TaskKind::SpillToDisk), 0);
        assert_eq!(factory.count(TaskKind::InputConsumer), 1);
        assert!(launcher.start().unwrap_err().is_illegal_state());
    }

    #[tokio::test]
    async fn staged_mode_launches_spill_task_once() {
        let (launcher, factory) = launcher(&["a", "b"], EngineConfig::default());
        launcher.start().unwrap();
        assert_eq!(factory.count(TaskKind::SpillToDisk), 1);
        testing::settle().await;
        // The stub spill task ran through the exception wrapper: it was
        // spawned and finished cleanly.
        assert!(factory.ran(TaskKind::SpillToDisk));
    }

    #[tokio::test]
    async fn completed_batch_launches_close_once() {
        let (launcher, factory) = launcher(&["a"], EngineConfig::default());
        let manager = launcher.sync_manager().stream_manager(&stream("a")).unwrap();
        manager.count_incoming_record(1).unwrap();
        manager.mark_end_of_stream().unwrap();

        let staged = Batch::staged("part-0");
        launcher
            .handle_new_batch(BatchEnvelope::new(stream("a"), 0..1, staged.clone()))
            .unwrap();
        assert_eq!(factory.count(TaskKind::CloseStream), 0);

        let complete = BatchEnvelope::new(stream("a"), 0..1, staged.with_state(BatchState::Complete));
        launcher.handle_new_batch(complete).unwrap();
        launcher.handle_end_of_stream(&stream("a")).unwrap();
        assert_eq!(factory.count(TaskKind::CloseStream), 1);
    }

    #[tokio::test]
    async fn setup_complete_opens_every_stream() {
        let (launcher, factory) = launcher(&["a", "b"], EngineConfig::default());
        launcher.handle_setup_complete();
        launcher.handle_setup_complete();
        assert_eq!(factory.count(TaskKind::OpenStream), 2);
        assert_eq!(factory.count(TaskKind::UpdateCheckpoints), 1);
        assert_eq!(factory.count(TaskKind::FlushCheckpoints), 1);

        launcher.handle_open_stream_complete(&stream("a"));
        assert_eq!(factory.count(TaskKind::ProcessRecords), 1);
        assert_eq!(factory.count(TaskKind::ProcessFile), 0);
    }
}
