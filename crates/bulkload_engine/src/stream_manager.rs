//! Per-stream state machine.
//!
//! A [`StreamManager`] tracks everything the pipeline knows about one stream:
//! how many records arrived, whether end-of-stream was seen, which batches
//! are in flight and which record indexes are durable.
//!
//! ```text
//! NotStarted ──► Running ──► EndOfStreamMarked ──► Succeeded
//!      │            │                │
//!      └────────────┴────────────────┴──────────► Failed
//! ```
//!
//! ## Key invariants
//!
//! - `Succeeded` requires end-of-stream and every batch complete
//! - terminal states are frozen; marking success or failure again is an
//!   [`SyncError::IllegalState`], except a repeated failure, which keeps the
//!   first cause
//! - terminal transitions notify the owning sync after the stream lock is
//!   released

use crate::batch::{BatchEnvelope, BatchId, BatchState};
use crate::error::{SharedError, SyncError, SyncResult};
use crate::range_set::RangeSet;
use bulkload_protocol::StreamDescriptor;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

/// Status of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    /// No records seen yet.
    NotStarted,
    /// Records are arriving.
    Running,
    /// The source will send no more records.
    EndOfStreamMarked,
    /// All data is durable and the loader closed cleanly.
    Succeeded,
    /// The stream failed.
    Failed,
}

impl StreamStatus {
    /// Returns true for `Succeeded` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamStatus::Succeeded | StreamStatus::Failed)
    }
}

/// Terminal outcome of a stream.
#[derive(Debug, Clone)]
pub enum StreamResult {
    /// The stream succeeded.
    Succeeded,
    /// The stream failed with the given cause.
    Failed(SharedError),
}

impl StreamResult {
    /// Returns true for failures.
    pub fn is_failed(&self) -> bool {
        matches!(self, StreamResult::Failed(_))
    }
}

/// Callback invoked on every stream terminal transition.
pub type TerminalListener = Arc<dyn Fn(&StreamDescriptor, &StreamResult) + Send + Sync>;

/// Fan-out of stream terminal transitions, shared by the sync manager and
/// every stream manager it owns.
#[derive(Default)]
pub(crate) struct TerminalNotifier {
    listeners: RwLock<Vec<TerminalListener>>,
}

impl TerminalNotifier {
    pub(crate) fn subscribe(&self, listener: TerminalListener) {
        self.listeners.write().push(listener);
    }

    fn notify(&self, stream: &StreamDescriptor, result: &StreamResult) {
        // Listeners may re-enter the engine; never call them under the lock.
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener(stream, result);
        }
    }
}

struct StreamInner {
    status: StreamStatus,
    end_of_stream: bool,
    record_count: u64,
    byte_count: u64,
    batches: HashMap<BatchId, BatchState>,
    persisted: RangeSet,
    completed: RangeSet,
    failure: Option<SharedError>,
}

/// State machine for one stream.
pub struct StreamManager {
    stream: StreamDescriptor,
    inner: Mutex<StreamInner>,
    status_tx: watch::Sender<StreamStatus>,
    notifier: Arc<TerminalNotifier>,
}

impl StreamManager {
    pub(crate) fn new(stream: StreamDescriptor, notifier: Arc<TerminalNotifier>) -> Self {
        let (status_tx, _) = watch::channel(StreamStatus::NotStarted);
        Self {
            stream,
            inner: Mutex::new(StreamInner {
                status: StreamStatus::NotStarted,
                end_of_stream: false,
                record_count: 0,
                byte_count: 0,
                batches: HashMap::new(),
                persisted: RangeSet::new(),
                completed: RangeSet::new(),
                failure: None,
            }),
            status_tx,
            notifier,
        }
    }

    /// Creates a manager with no sync attached.
    pub fn detached(stream: StreamDescriptor) -> Self {
        Self::new(stream, Arc::new(TerminalNotifier::default()))
    }

    /// The stream this manager tracks.
    pub fn stream(&self) -> &StreamDescriptor {
        &self.stream
    }

    /// Current status.
    pub fn status(&self) -> StreamStatus {
        self.inner.lock().status
    }

    /// Returns true once the stream succeeded or failed.
    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// Returns true if the stream failed.
    pub fn is_failed(&self) -> bool {
        self.status() == StreamStatus::Failed
    }

    /// The first failure recorded for the stream.
    pub fn failure(&self) -> Option<SharedError> {
        self.inner.lock().failure.clone()
    }

    /// The terminal outcome, if any.
    pub fn result(&self) -> Option<StreamResult> {
        let inner = self.inner.lock();
        let status = inner.status;
        match status {
            StreamStatus::Succeeded => Some(StreamResult::Succeeded),
            StreamStatus::Failed => inner.failure.clone().map(StreamResult::Failed),
            _ => None,
        }
    }

    /// Returns true if end-of-stream was observed, even if the stream has
    /// since reached a terminal state.
    pub fn end_of_stream_marked(&self) -> bool {
        self.inner.lock().end_of_stream
    }

    /// Number of records counted so far.
    pub fn record_count(&self) -> u64 {
        self.inner.lock().record_count
    }

    /// Number of bytes counted so far.
    pub fn byte_count(&self) -> u64 {
        self.inner.lock().byte_count
    }

    /// Latest known state of a batch.
    pub fn batch_state(&self, id: &BatchId) -> Option<BatchState> {
        self.inner.lock().batches.get(id).copied()
    }

    /// Counts an incoming record and returns its index.
    ///
    /// Returns `None` when the stream already failed; the caller drops the
    /// record.
    pub fn count_incoming_record(&self, bytes: u64) -> SyncResult<Option<u64>> {
        let mut inner = self.inner.lock();
        let status = inner.status;
        match status {
            StreamStatus::Failed => return Ok(None),
            StreamStatus::Succeeded => {
                return Err(SyncError::illegal_state(format!(
                    "record received for stream {} after it succeeded",
                    self.stream
                )))
            }
            StreamStatus::EndOfStreamMarked => {
                return Err(SyncError::illegal_state(format!(
                    "record received for stream {} after end-of-stream",
                    self.stream
                )))
            }
            StreamStatus::NotStarted => self.set_status(&mut inner, StreamStatus::Running),
            StreamStatus::Running => {}
        }
        let index = inner.record_count;
        inner.record_count += 1;
        inner.byte_count += bytes;
        Ok(Some(index))
    }

    /// Marks end-of-stream and returns the final record count.
    ///
    /// Returns `None` when the stream already failed.
    pub fn mark_end_of_stream(&self) -> SyncResult<Option<u64>> {
        let mut inner = self.inner.lock();
        let status = inner.status;
        match status {
            StreamStatus::Failed => Ok(None),
            StreamStatus::EndOfStreamMarked | StreamStatus::Succeeded => Err(
                SyncError::illegal_state(format!("end-of-stream already marked for {}", self.stream)),
            ),
            StreamStatus::NotStarted | StreamStatus::Running => {
                inner.end_of_stream = true;
                self.set_status(&mut inner, StreamStatus::EndOfStreamMarked);
                Ok(Some(inner.record_count))
            }
        }
    }

    /// Records a batch's new state.
    ///
    /// Returns `false` if the update was ignored because the stream failed.
    pub fn update_batch_state(&self, envelope: &BatchEnvelope) -> SyncResult<bool> {
        let mut inner = self.inner.lock();
        let status = inner.status;
        match status {
            StreamStatus::Failed => return Ok(false),
            StreamStatus::Succeeded => {
                return Err(SyncError::illegal_state(format!(
                    "batch {} reported for stream {} after it succeeded",
                    envelope.batch.id, self.stream
                )))
            }
            _ => {}
        }
        if envelope.records.end > inner.record_count {
            return Err(SyncError::illegal_state(format!(
                "batch {} covers records {:?} but stream {} has only counted {}",
                envelope.batch.id, envelope.records, self.stream, inner.record_count
            )));
        }

        let state = envelope.batch.state;
        if let Some(previous) = inner.batches.get(&envelope.batch.id) {
            if state < *previous {
                return Err(SyncError::illegal_state(format!(
                    "batch {} moved backwards from {:?} to {:?}",
                    envelope.batch.id, previous, state
                )));
            }
        }
        inner.batches.insert(envelope.batch.id, state);
        if state.is_persisted() {
            inner.persisted.insert(envelope.records.clone());
        }
        if state == BatchState::Complete {
            inner.completed.insert(envelope.records.clone());
        }
        Ok(true)
    }

    /// Records a newly staged batch.
    pub fn record_batch_staged(&self, envelope: &BatchEnvelope) -> SyncResult<bool> {
        self.update_batch_state(envelope)
    }

    /// Records a completed batch.
    pub fn record_batch_complete(&self, envelope: &BatchEnvelope) -> SyncResult<bool> {
        if !envelope.batch.is_complete() {
            return Err(SyncError::illegal_state(format!(
                "batch {} is {:?}, not complete",
                envelope.batch.id, envelope.batch.state
            )));
        }
        self.update_batch_state(envelope)
    }

    /// Returns true when end-of-stream was marked and every record and batch
    /// is complete, i.e. the stream may be closed.
    pub fn is_batch_processing_complete(&self) -> bool {
        let inner = self.inner.lock();
        Self::processing_complete(&inner)
    }

    /// Returns true when every record before `index` is persisted.
    pub fn records_persisted_until(&self, index: u64) -> bool {
        self.inner.lock().persisted.encloses(0..index)
    }

    /// Moves the stream to `Succeeded`.
    pub fn mark_succeeded(&self) -> SyncResult<()> {
        {
            let mut inner = self.inner.lock();
            let status = inner.status;
            match status {
                StreamStatus::Succeeded => {
                    return Err(SyncError::illegal_state(format!(
                        "stream {} already succeeded",
                        self.stream
                    )))
                }
                StreamStatus::Failed => {
                    return Err(SyncError::illegal_state(format!(
                        "stream {} already failed",
                        self.stream
                    )))
                }
                StreamStatus::NotStarted | StreamStatus::Running => {
                    return Err(SyncError::illegal_state(format!(
                        "stream {} cannot succeed before end-of-stream",
                        self.stream
                    )))
                }
                StreamStatus::EndOfStreamMarked => {}
            }
            if !Self::processing_complete(&inner) {
                let pending = inner
                    .batches
                    .values()
                    .filter(|state| **state != BatchState::Complete)
                    .count();
                return Err(SyncError::illegal_state(format!(
                    "stream {} has {} incomplete batch(es) and {} of {} records complete",
                    self.stream,
                    pending,
                    inner.completed.len(),
                    inner.record_count
                )));
            }
            self.set_status(&mut inner, StreamStatus::Succeeded);
        }
        self.notifier.notify(&self.stream, &StreamResult::Succeeded);
        Ok(())
    }

    /// Moves the stream to `Failed`.
    ///
    /// Returns `true` if this call recorded the failure, `false` if the
    /// stream had already failed (the first cause is kept).
    pub fn mark_failed(&self, error: SharedError) -> SyncResult<bool> {
        {
            let mut inner = self.inner.lock();
            let status = inner.status;
            match status {
                StreamStatus::Failed => return Ok(false),
                StreamStatus::Succeeded => {
                    return Err(SyncError::illegal_state(format!(
                        "stream {} already succeeded",
                        self.stream
                    )))
                }
                _ => {}
            }
            inner.failure = Some(Arc::clone(&error));
            self.set_status(&mut inner, StreamStatus::Failed);
        }
        self.notifier.notify(&self.stream, &StreamResult::Failed(error));
        Ok(true)
    }

    /// Suspends until the stream fails. Never resolves for a stream that
    /// succeeds.
    pub async fn await_failed(&self) {
        let mut rx = self.status_tx.subscribe();
        // The sender lives as long as `self`.
        let _ = rx.wait_for(|status| *status == StreamStatus::Failed).await;
    }

    /// Suspends until the stream reaches a terminal state.
    pub async fn await_terminal(&self) -> StreamStatus {
        let mut rx = self.status_tx.subscribe();
        let terminal = rx
            .wait_for(|status| status.is_terminal())
            .await
            .map(|status| *status);
        terminal.unwrap_or_else(|_| self.status())
    }

    fn processing_complete(inner: &StreamInner) -> bool {
        inner.status == StreamStatus::EndOfStreamMarked
            && inner.completed.encloses(0..inner.record_count)
            && inner
                .batches
                .values()
                .all(|state| *state == BatchState::Complete)
    }

    fn set_status(&self, inner: &mut StreamInner, status: StreamStatus) {
        inner.status = status;
        self.status_tx.send_replace(status);
    }
}

impl std::fmt::Debug for StreamManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("StreamManager")
            .field("stream", &self.stream)
            .field("status", &inner.status)
            .field("record_count", &inner.record_count)
            .field("batches", &inner.batches.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::Batch;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn users() -> StreamDescriptor {
        StreamDescriptor::new("public", "users")
    }

    fn manager() -> StreamManager {
        StreamManager::detached(users())
    }

    fn failure(message: &str) -> SharedError {
        Arc::new(SyncError::destination(message))
    }

    /// Counts `n` records, marks end-of-stream and completes one batch
    /// covering them.
    fn drive_to_complete(manager: &StreamManager, n: u64) {
        for _ in 0..n {
            manager.count_incoming_record(10).unwrap();
        }
        manager.mark_end_of_stream().unwrap();
        let env = BatchEnvelope::new(users(), 0..n, Batch::complete());
        manager.record_batch_complete(&env).unwrap();
    }

    #[test]
    fn counts_records_and_bytes() {
        let manager = manager();
        assert_eq!(manager.status(), StreamStatus::NotStarted);
        assert_eq!(manager.count_incoming_record(5).unwrap(), Some(0));
        assert_eq!(manager.count_incoming_record(7).unwrap(), Some(1));
        assert_eq!(manager.status(), StreamStatus::Running);
        assert_eq!(manager.record_count(), 2);
        assert_eq!(manager.byte_count(), 12);
    }

    #[test]
    fn end_of_stream_twice_is_illegal() {
        let manager = manager();
        assert_eq!(manager.mark_end_of_stream().unwrap(), Some(0));
        assert!(manager.mark_end_of_stream().unwrap_err().is_illegal_state());
    }

    #[test]
    fn record_after_end_of_stream_is_illegal() {
        let manager = manager();
        manager.mark_end_of_stream().unwrap();
        assert!(manager.count_incoming_record(1).unwrap_err().is_illegal_state());
    }

    #[test]
    fn succeed_requires_end_of_stream() {
        let manager = manager();
        manager.count_incoming_record(1).unwrap();
        let env = BatchEnvelope::new(users(), 0..1, Batch::complete());
        manager.record_batch_complete(&env).unwrap();
        assert!(!manager.is_batch_processing_complete());
        assert!(manager.mark_succeeded().unwrap_err().is_illegal_state());
    }

    #[test]
    fn succeed_requires_complete_batches() {
        let manager = manager();
        manager.count_incoming_record(1).unwrap();
        manager.mark_end_of_stream().unwrap();
        let batch = Batch::staged("part-0");
        let env = BatchEnvelope::new(users(), 0..1, batch.clone());
        manager.record_batch_staged(&env).unwrap();
        assert!(manager.mark_succeeded().unwrap_err().is_illegal_state());

        let env = env.with_batch(batch.with_state(BatchState::Complete));
        manager.record_batch_complete(&env).unwrap();
        assert!(manager.is_batch_processing_complete());
        manager.mark_succeeded().unwrap();
        assert_eq!(manager.status(), StreamStatus::Succeeded);
    }

    #[test]
    fn empty_stream_can_succeed() {
        let manager = manager();
        manager.mark_end_of_stream().unwrap();
        assert!(manager.is_batch_processing_complete());
        manager.mark_succeeded().unwrap();
    }

    #[test]
    fn mark_succeeded_twice_is_illegal() {
        let manager = manager();
        drive_to_complete(&manager, 3);
        manager.mark_succeeded().unwrap();
        assert!(manager.mark_succeeded().unwrap_err().is_illegal_state());
    }

    #[test]
    fn mark_succeeded_after_failure_is_illegal_and_keeps_failure() {
        let manager = manager();
        drive_to_complete(&manager, 3);
        assert!(manager.mark_failed(failure("boom")).unwrap());
        assert!(manager.mark_succeeded().unwrap_err().is_illegal_state());
        assert_eq!(manager.status(), StreamStatus::Failed);
        assert!(manager.result().unwrap().is_failed());
    }

    #[test]
    fn first_failure_wins() {
        let manager = manager();
        assert!(manager.mark_failed(failure("first")).unwrap());
        assert!(!manager.mark_failed(failure("second")).unwrap());
        assert_eq!(manager.failure().unwrap().to_string(), "destination error: first");
    }

    #[test]
    fn failure_after_success_is_illegal() {
        let manager = manager();
        drive_to_complete(&manager, 1);
        manager.mark_succeeded().unwrap();
        assert!(manager.mark_failed(failure("late")).unwrap_err().is_illegal_state());
        assert_eq!(manager.status(), StreamStatus::Succeeded);
    }

    #[test]
    fn failed_stream_drops_records_and_batches() {
        let manager = manager();
        manager.count_incoming_record(1).unwrap();
        manager.mark_failed(failure("boom")).unwrap();
        assert_eq!(manager.count_incoming_record(1).unwrap(), None);
        assert_eq!(manager.mark_end_of_stream().unwrap(), None);
        let env = BatchEnvelope::new(users(), 0..1, Batch::complete());
        assert!(!manager.update_batch_state(&env).unwrap());
        // End-of-stream was never observed.
        assert!(!manager.end_of_stream_marked());
    }

    #[test]
    fn batch_state_cannot_regress() {
        let manager = manager();
        manager.count_incoming_record(1).unwrap();
        let batch = Batch::new(BatchState::Persisted);
        let env = BatchEnvelope::new(users(), 0..1, batch.clone());
        manager.update_batch_state(&env).unwrap();
        let regressed = env.with_batch(batch.with_state(BatchState::Staged));
        assert!(manager.update_batch_state(&regressed).unwrap_err().is_illegal_state());
    }

    #[test]
    fn batch_beyond_counted_records_is_illegal() {
        let manager = manager();
        manager.count_incoming_record(1).unwrap();
        let env = BatchEnvelope::new(users(), 0..2, Batch::complete());
        assert!(manager.update_batch_state(&env).unwrap_err().is_illegal_state());
    }

    #[test]
    fn persisted_ranges_gate_checkpoints() {
        let manager = manager();
        for _ in 0..10 {
            manager.count_incoming_record(1).unwrap();
        }
        let later = BatchEnvelope::new(users(), 5..10, Batch::new(BatchState::Persisted));
        manager.update_batch_state(&later).unwrap();
        assert!(manager.records_persisted_until(0));
        assert!(!manager.records_persisted_until(10));

        let earlier = BatchEnvelope::new(users(), 0..5, Batch::new(BatchState::Staged));
        manager.update_batch_state(&earlier).unwrap();
        assert!(!manager.records_persisted_until(5));

        manager
            .update_batch_state(&earlier.clone().with_batch(earlier.batch.clone().with_state(BatchState::Complete)))
            .unwrap();
        assert!(manager.records_persisted_until(10));
    }

    #[test]
    fn terminal_transitions_notify_listeners() {
        let notifier = Arc::new(TerminalNotifier::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        notifier.subscribe(Arc::new(move |stream, result| {
            assert_eq!(stream, &users());
            assert!(result.is_failed());
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        let manager = StreamManager::new(users(), notifier);
        manager.mark_failed(failure("boom")).unwrap();
        manager.mark_failed(failure("again")).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn await_failed_resolves_on_failure_only() {
        let manager = Arc::new(manager());
        let waiter = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.await_failed().await })
        };

        manager.mark_end_of_stream().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        manager.mark_failed(failure("boom")).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should resolve")
            .unwrap();
    }
}
