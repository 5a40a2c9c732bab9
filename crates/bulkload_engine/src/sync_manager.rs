//! Sync-wide state.
//!
//! The [`SyncManager`] is the single source of truth for "is stream X done"
//! and "is the sync done". It owns one [`StreamManager`] per catalog stream,
//! the stream loaders opened by the pipeline and the sync's terminal status.
//!
//! A single stream failing does not fail the sync. The sync fails when a
//! sync-level task fails, or when every stream has failed on its own.

use crate::destination::StreamLoader;
use crate::error::{SharedError, SyncError, SyncResult};
use crate::stream_manager::{StreamManager, StreamStatus, TerminalListener, TerminalNotifier};
use bulkload_protocol::{DestinationCatalog, StreamDescriptor};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Sync-wide terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// The sync is in progress.
    Running,
    /// The sync completed.
    Succeeded,
    /// The sync failed.
    Failed,
}

#[derive(Clone)]
enum LoaderSlot {
    Pending,
    Ready(Arc<dyn StreamLoader>),
    Released,
}

struct SyncState {
    status: SyncStatus,
    failure: Option<SharedError>,
}

/// Per-stream line of a [`SyncSummary`].
#[derive(Debug, Clone)]
pub struct StreamSummary {
    /// The stream.
    pub stream: StreamDescriptor,
    /// Status at the time of the summary.
    pub status: StreamStatus,
    /// Records received.
    pub record_count: u64,
    /// Bytes received.
    pub byte_count: u64,
    /// Failure cause for failed streams.
    pub failure: Option<SharedError>,
}

/// Outcome of a sync that did not fail as a whole.
#[derive(Debug, Clone, Default)]
pub struct SyncSummary {
    /// One entry per catalog stream, in catalog order.
    pub streams: Vec<StreamSummary>,
}

impl SyncSummary {
    /// Streams that failed individually.
    pub fn failed_streams(&self) -> impl Iterator<Item = &StreamSummary> {
        self.streams
            .iter()
            .filter(|s| s.status == StreamStatus::Failed)
    }

    /// Number of streams that succeeded.
    pub fn succeeded_count(&self) -> usize {
        self.streams
            .iter()
            .filter(|s| s.status == StreamStatus::Succeeded)
            .count()
    }

    /// Looks up one stream's entry.
    pub fn stream(&self, stream: &StreamDescriptor) -> Option<&StreamSummary> {
        self.streams.iter().find(|s| &s.stream == stream)
    }
}

/// Owns every stream's state and the sync's terminal status.
pub struct SyncManager {
    catalog: Arc<DestinationCatalog>,
    streams: HashMap<StreamDescriptor, Arc<StreamManager>>,
    loaders: HashMap<StreamDescriptor, watch::Sender<LoaderSlot>>,
    notifier: Arc<TerminalNotifier>,
    state: Mutex<SyncState>,
}

impl SyncManager {
    /// Creates a manager with one stream manager per catalog stream.
    pub fn new(catalog: Arc<DestinationCatalog>) -> Self {
        let notifier = Arc::new(TerminalNotifier::default());
        let mut streams = HashMap::with_capacity(catalog.len());
        let mut loaders = HashMap::with_capacity(catalog.len());
        for stream in catalog.streams() {
            streams.insert(
                stream.clone(),
                Arc::new(StreamManager::new(stream.clone(), Arc::clone(&notifier))),
            );
            let (tx, _) = watch::channel(LoaderSlot::Pending);
            loaders.insert(stream.clone(), tx);
        }
        Self {
            catalog,
            streams,
            loaders,
            notifier,
            state: Mutex::new(SyncState {
                status: SyncStatus::Running,
                failure: None,
            }),
        }
    }

    /// The configured catalog.
    pub fn catalog(&self) -> &Arc<DestinationCatalog> {
        &self.catalog
    }

    /// Returns the manager for a stream.
    pub fn stream_manager(&self, stream: &StreamDescriptor) -> SyncResult<Arc<StreamManager>> {
        self.streams
            .get(stream)
            .cloned()
            .ok_or_else(|| SyncError::UnknownStream(stream.clone()))
    }

    /// Iterates over stream managers in catalog order.
    pub fn stream_managers(&self) -> impl Iterator<Item = &Arc<StreamManager>> {
        self.catalog
            .streams()
            .iter()
            .filter_map(|stream| self.streams.get(stream))
    }

    /// Registers a listener for stream terminal transitions.
    pub fn subscribe_stream_terminal(&self, listener: TerminalListener) {
        self.notifier.subscribe(listener);
    }

    /// Current sync status.
    pub fn status(&self) -> SyncStatus {
        self.state.lock().status
    }

    /// Returns true once a sync failure was recorded.
    pub fn is_failed(&self) -> bool {
        self.status() == SyncStatus::Failed
    }

    /// The failure that failed the sync.
    pub fn failure(&self) -> Option<SharedError> {
        self.state.lock().failure.clone()
    }

    /// Records a sync failure.
    ///
    /// Only the first call has an effect; it returns `true`. Later calls
    /// return `false` and keep the original cause.
    pub fn mark_failed(&self, error: SharedError) -> bool {
        let mut state = self.state.lock();
        match state.status {
            SyncStatus::Failed => {
                debug!(error = %error, "sync already failed, keeping first failure");
                false
            }
            SyncStatus::Succeeded => {
                warn!(error = %error, "failure reported after sync succeeded");
                false
            }
            SyncStatus::Running => {
                state.status = SyncStatus::Failed;
                state.failure = Some(error);
                true
            }
        }
    }

    /// Records sync success.
    pub fn mark_succeeded(&self) -> SyncResult<()> {
        let mut state = self.state.lock();
        match state.status {
            SyncStatus::Running => {
                state.status = SyncStatus::Succeeded;
                Ok(())
            }
            other => Err(SyncError::illegal_state(format!(
                "cannot mark sync succeeded, status is {other:?}"
            ))),
        }
    }

    /// Returns true when the catalog is non-empty and every stream failed.
    pub fn all_streams_failed(&self) -> bool {
        !self.streams.is_empty() && self.streams.values().all(|manager| manager.is_failed())
    }

    /// Returns true when every stream reached a terminal state.
    pub fn all_streams_terminal(&self) -> bool {
        self.streams.values().all(|manager| manager.is_terminal())
    }

    /// Makes an opened loader available to the stream's tasks.
    ///
    /// Returns `false` if the stream failed in the meantime; the loader is
    /// not stored and the caller must release it.
    pub fn register_stream_loader(
        &self,
        stream: &StreamDescriptor,
        loader: Arc<dyn StreamLoader>,
    ) -> SyncResult<bool> {
        let manager = self.stream_manager(stream)?;
        let slot = self.loader_slot(stream)?;
        let mut illegal = false;
        let registered = slot.send_if_modified(|slot| {
            if manager.is_failed() {
                return false;
            }
            match slot {
                LoaderSlot::Pending => {
                    *slot = LoaderSlot::Ready(loader);
                    true
                }
                _ => {
                    illegal = true;
                    false
                }
            }
        });
        if illegal {
            return Err(SyncError::illegal_state(format!(
                "stream loader for {stream} registered twice"
            )));
        }
        Ok(registered)
    }

    /// Returns the stream's loader, suspending until it is registered.
    ///
    /// Fails with [`SyncError::StreamFailed`] if the stream fails first.
    pub async fn get_or_await_stream_loader(
        &self,
        stream: &StreamDescriptor,
    ) -> SyncResult<Arc<dyn StreamLoader>> {
        let manager = self.stream_manager(stream)?;
        let mut rx = self.loader_slot(stream)?.subscribe();
        loop {
            if let Some(cause) = manager.failure() {
                return Err(SyncError::StreamFailed {
                    stream: stream.clone(),
                    cause,
                });
            }
            let slot = rx.borrow_and_update().clone();
            match slot {
                LoaderSlot::Ready(loader) => return Ok(loader),
                LoaderSlot::Released => {
                    return Err(SyncError::illegal_state(format!(
                        "stream loader for {stream} was already released"
                    )))
                }
                LoaderSlot::Pending => {}
            }
            tokio::select! {
                changed = rx.changed() => {
                    changed.map_err(|_| SyncError::QueueClosed("stream loader slot"))?;
                }
                _ = manager.await_failed() => {}
            }
        }
    }

    /// Takes the loader out for closing. Returns `None` if the loader was
    /// never registered or was already released.
    pub fn take_stream_loader(
        &self,
        stream: &StreamDescriptor,
    ) -> SyncResult<Option<Arc<dyn StreamLoader>>> {
        let slot = self.loader_slot(stream)?;
        let mut taken = None;
        slot.send_if_modified(|slot| {
            if let LoaderSlot::Ready(loader) = slot {
                taken = Some(Arc::clone(loader));
                *slot = LoaderSlot::Released;
                true
            } else {
                false
            }
        });
        Ok(taken)
    }

    /// Snapshot of every stream's progress.
    pub fn summary(&self) -> SyncSummary {
        SyncSummary {
            streams: self
                .stream_managers()
                .map(|manager| StreamSummary {
                    stream: manager.stream().clone(),
                    status: manager.status(),
                    record_count: manager.record_count(),
                    byte_count: manager.byte_count(),
                    failure: manager.failure(),
                })
                .collect(),
        }
    }

    fn loader_slot(&self, stream: &StreamDescriptor) -> SyncResult<&watch::Sender<LoaderSlot>> {
        self.loaders
            .get(stream)
            .ok_or_else(|| SyncError::UnknownStream(stream.clone()))
    }
}
