//! In-memory destination.
//!
//! [`MemoryDestination`] keeps everything it receives so tests can assert on
//! what a sync persisted. Faults can be injected per stream and per loader
//! operation.

use async_trait::async_trait;
use bulkload_engine::{
    Batch, BatchId, BatchState, Destination, StreamLoader, SyncError, SyncResult,
};
use bulkload_protocol::{DestinationFile, DestinationRecord, StreamDescriptor};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// A loader operation that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    /// `start` returns an error.
    Start,
    /// `process_records` returns an error.
    ProcessRecords,
    /// `process_file` returns an error.
    ProcessFile,
    /// `process_batch` returns an error.
    ProcessBatch,
    /// `close` without a failure returns an error.
    Close,
}

/// A call observed by a [`MemoryStreamLoader`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoaderCall {
    /// `start`.
    Start,
    /// `process_records` with the number of records.
    ProcessRecords(usize),
    /// `process_file` with the file path.
    ProcessFile(String),
    /// `process_batch` with the incoming state.
    ProcessBatch(BatchState),
    /// `close`; `failed` is set when a failure was passed.
    Close {
        /// Whether the stream failed.
        failed: bool,
    },
    /// `abort`.
    Abort,
}

/// Destination that stores everything in memory.
#[derive(Default)]
pub struct MemoryDestination {
    faults: Mutex<HashMap<StreamDescriptor, HashSet<Fault>>>,
    loaders: Mutex<BTreeMap<StreamDescriptor, Arc<MemoryStreamLoader>>>,
    fail_setup: AtomicBool,
    setup_called: AtomicBool,
    teardown: Mutex<Vec<bool>>,
}

impl MemoryDestination {
    /// Creates a destination without faults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `fault` fire for every loader of `stream`.
    pub fn with_fault(self, stream: &StreamDescriptor, fault: Fault) -> Self {
        self.faults
            .lock()
            .entry(stream.clone())
            .or_default()
            .insert(fault);
        self
    }

    /// Makes destination setup fail.
    pub fn with_failing_setup(self) -> Self {
        self.fail_setup.store(true, Ordering::SeqCst);
        self
    }

    /// Returns the loader created for `stream`, if any.
    pub fn loader(&self, stream: &StreamDescriptor) -> Option<Arc<MemoryStreamLoader>> {
        self.loaders.lock().get(stream).cloned()
    }

    /// Returns true once setup ran.
    pub fn setup_called(&self) -> bool {
        self.setup_called.load(Ordering::SeqCst)
    }

    /// The `succeeded` flag of every teardown call, in order.
    pub fn teardown_calls(&self) -> Vec<bool> {
        self.teardown.lock().clone()
    }

    /// Records persisted for `stream`.
    pub fn persisted(&self, stream: &StreamDescriptor) -> Vec<DestinationRecord> {
        self.loader(stream)
            .map(|loader| loader.persisted())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Destination for MemoryDestination {
    async fn setup(&self) -> SyncResult<()> {
        self.setup_called.store(true, Ordering::SeqCst);
        if self.fail_setup.load(Ordering::SeqCst) {
            return Err(SyncError::destination("setup rejected by memory destination"));
        }
        Ok(())
    }

    fn create_stream_loader(&self, stream: &StreamDescriptor) -> SyncResult<Arc<dyn StreamLoader>> {
        let faults = self.faults.lock().get(stream).cloned().unwrap_or_default();
        let loader = Arc::new(MemoryStreamLoader::new(stream.clone(), faults));
        self.loaders.lock().insert(stream.clone(), Arc::clone(&loader));
        Ok(loader)
    }

    async fn teardown(&self, succeeded: bool) -> SyncResult<()> {
        self.teardown.lock().push(succeeded);
        Ok(())
    }
}

/// Loader that stages records in memory and persists them when their batch
/// advances.
///
/// `process_records` returns a staged batch; `process_batch` moves it to
/// persisted and then to complete.
pub struct MemoryStreamLoader {
    stream: StreamDescriptor,
    faults: HashSet<Fault>,
    calls: Mutex<Vec<LoaderCall>>,
    staged: Mutex<HashMap<BatchId, Vec<DestinationRecord>>>,
    persisted: Mutex<Vec<DestinationRecord>>,
    files: Mutex<Vec<DestinationFile>>,
    parts: AtomicU64,
}

impl MemoryStreamLoader {
    fn new(stream: StreamDescriptor, faults: HashSet<Fault>) -> Self {
        Self {
            stream,
            faults,
            calls: Mutex::new(Vec::new()),
            staged: Mutex::new(HashMap::new()),
            persisted: Mutex::new(Vec::new()),
            files: Mutex::new(Vec::new()),
            parts: AtomicU64::new(0),
        }
    }

    /// Calls observed so far.
    pub fn calls(&self) -> Vec<LoaderCall> {
        self.calls.lock().clone()
    }

    /// Number of observed calls matching `predicate`.
    pub fn count_calls(&self, predicate: impl Fn(&LoaderCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|call| predicate(call)).count()
    }

    /// Records whose batches reached the persisted state.
    pub fn persisted(&self) -> Vec<DestinationRecord> {
        self.persisted.lock().clone()
    }

    /// Files transferred.
    pub fn files(&self) -> Vec<DestinationFile> {
        self.files.lock().clone()
    }

    fn record(&self, call: LoaderCall) {
        self.calls.lock().push(call);
    }

    fn check(&self, fault: Fault) -> SyncResult<()> {
        if self.faults.contains(&fault) {
            return Err(SyncError::destination(format!(
                "injected {fault:?} fault for {}",
                self.stream
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl StreamLoader for MemoryStreamLoader {
    async fn start(&self) -> SyncResult<()> {
        self.record(LoaderCall::Start);
        self.check(Fault::Start)
    }

    async fn process_records(&self, records: Vec<DestinationRecord>) -> SyncResult<Batch> {
        self.record(LoaderCall::ProcessRecords(records.len()));
        self.check(Fault::ProcessRecords)?;
        let part = self.parts.fetch_add(1, Ordering::SeqCst);
        let batch = Batch::staged(format!("memory://{}/part-{part}", self.stream));
        self.staged.lock().insert(batch.id, records);
        Ok(batch)
    }

    async fn process_file(&self, file: DestinationFile) -> SyncResult<Batch> {
        self.record(LoaderCall::ProcessFile(file.file_path.clone()));
        self.check(Fault::ProcessFile)?;
        self.files.lock().push(file);
        Ok(Batch::complete())
    }

    async fn process_batch(&self, batch: Batch) -> SyncResult<Batch> {
        self.record(LoaderCall::ProcessBatch(batch.state));
        self.check(Fault::ProcessBatch)?;
        match batch.state {
            BatchState::Staged => {
                let records = self.staged.lock().remove(&batch.id).unwrap_or_default();
                self.persisted.lock().extend(records);
                Ok(batch.with_state(BatchState::Persisted))
            }
            BatchState::Persisted | BatchState::Complete => {
                Ok(batch.with_state(BatchState::Complete))
            }
        }
    }

    async fn close(&self, failure: Option<&SyncError>) -> SyncResult<()> {
        self.record(LoaderCall::Close {
            failed: failure.is_some(),
        });
        if failure.is_none() {
            self.check(Fault::Close)?;
        }
        Ok(())
    }

    async fn abort(&self, _failure: &SyncError) -> SyncResult<()> {
        self.record(LoaderCall::Abort);
        self.staged.lock().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(stream: &StreamDescriptor, id: i64) -> DestinationRecord {
        DestinationRecord::new(stream.clone(), serde_json::json!({ "id": id }), 0)
    }

    #[tokio::test]
    async fn records_persist_when_batch_advances() {
        let stream = StreamDescriptor::new("public", "users");
        let destination = MemoryDestination::new();
        let loader = destination.create_stream_loader(&stream).unwrap();

        let batch = loader
            .process_records(vec![record(&stream, 1), record(&stream, 2)])
            .await
            .unwrap();
        assert_eq!(batch.state, BatchState::Staged);
        assert!(destination.persisted(&stream).is_empty());

        let batch = loader.process_batch(batch).await.unwrap();
        assert_eq!(batch.state, BatchState::Persisted);
        assert_eq!(destination.persisted(&stream).len(), 2);

        let batch = loader.process_batch(batch).await.unwrap();
        assert!(batch.is_complete());
    }

    #[tokio::test]
    async fn faults_fire_only_for_their_stream() {
        let users = StreamDescriptor::new("public", "users");
        let orders = StreamDescriptor::new("public", "orders");
        let destination = MemoryDestination::new().with_fault(&users, Fault::Start);

        assert!(destination.create_stream_loader(&users).unwrap().start().await.is_err());
        assert!(destination.create_stream_loader(&orders).unwrap().start().await.is_ok());
    }

    #[tokio::test]
    async fn close_fault_spares_failure_close() {
        let stream = StreamDescriptor::unnamespaced("events");
        let destination = MemoryDestination::new().with_fault(&stream, Fault::Close);
        let loader = destination.create_stream_loader(&stream).unwrap();

        assert!(loader.close(None).await.is_err());
        let cause = SyncError::destination("boom");
        assert!(loader.close(Some(&cause)).await.is_ok());
        assert_eq!(
            destination.loader(&stream).unwrap().calls(),
            vec![
                LoaderCall::Close { failed: false },
                LoaderCall::Close { failed: true }
            ]
        );
    }
}
