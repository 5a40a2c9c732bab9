//! Checkpoint bookkeeping.
//!
//! A checkpoint may only reach the platform once every record it covers is
//! durable in the destination. The [`CheckpointManager`] keeps pending
//! checkpoints in arrival order and emits them as their streams' persisted
//! ranges catch up.
//!
//! Stream checkpoints are ordered per stream; a blocked checkpoint only holds
//! back later checkpoints of the same stream. Global checkpoints are totally
//! ordered.

use crate::destination::OutputConsumer;
use crate::error::{SyncError, SyncResult};
use crate::queue::StampedCheckpoint;
use crate::reservation::Reserved;
use crate::sync_manager::SyncManager;
use bulkload_protocol::{CheckpointScope, StreamDescriptor};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckpointMode {
    PerStream,
    Global,
}

struct CheckpointInner {
    pending: VecDeque<Reserved<StampedCheckpoint>>,
    mode: Option<CheckpointMode>,
    emitted: u64,
}

/// Orders checkpoints behind the data they cover.
pub struct CheckpointManager {
    sync_manager: Arc<SyncManager>,
    inner: Mutex<CheckpointInner>,
    drained: watch::Sender<bool>,
}

impl CheckpointManager {
    /// Creates an empty manager.
    pub fn new(sync_manager: Arc<SyncManager>) -> Self {
        let (drained, _) = watch::channel(false);
        Self {
            sync_manager,
            inner: Mutex::new(CheckpointInner {
                pending: VecDeque::new(),
                mode: None,
                emitted: 0,
            }),
            drained,
        }
    }

    /// Queues a checkpoint.
    ///
    /// Mixing stream and global checkpoints in one sync is an
    /// [`SyncError::IllegalState`].
    pub fn add(&self, checkpoint: Reserved<StampedCheckpoint>) -> SyncResult<()> {
        let mode = match checkpoint.message.scope {
            CheckpointScope::Stream(_) => CheckpointMode::PerStream,
            CheckpointScope::Global => CheckpointMode::Global,
        };
        let mut inner = self.inner.lock();
        match inner.mode {
            Some(current) if current != mode => {
                return Err(SyncError::illegal_state(format!(
                    "received {mode:?} checkpoint in a sync using {current:?} checkpoints"
                )))
            }
            _ => inner.mode = Some(mode),
        }
        for stream in checkpoint.positions.keys() {
            if self.sync_manager.stream_manager(stream)?.is_failed() {
                debug!(stream = %stream, "checkpoint covers failed stream, dropped");
                return Ok(());
            }
        }
        trace!(pending = inner.pending.len() + 1, "checkpoint queued");
        inner.pending.push_back(checkpoint);
        Ok(())
    }

    /// Drops every pending checkpoint covering `stream`, releasing their
    /// reservations. Such checkpoints can never be emitted once the stream
    /// failed. Returns the number dropped.
    pub fn discard_stream(&self, stream: &StreamDescriptor) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.pending.len();
        inner
            .pending
            .retain(|checkpoint| !checkpoint.positions.contains_key(stream));
        let dropped = before - inner.pending.len();
        if dropped > 0 {
            debug!(stream = %stream, dropped, "checkpoints of failed stream dropped");
        }
        dropped
    }

    /// Emits every checkpoint whose data is persisted. Returns the number
    /// emitted.
    pub fn flush_ready(&self, output: &dyn OutputConsumer) -> SyncResult<usize> {
        let mut inner = self.inner.lock();
        let mut blocked: HashSet<StreamDescriptor> = HashSet::new();
        let mut global_blocked = false;
        let mut kept = VecDeque::with_capacity(inner.pending.len());
        let mut emitted = 0;

        while let Some(checkpoint) = inner.pending.pop_front() {
            let ready = match &checkpoint.message.scope {
                CheckpointScope::Stream(stream) => {
                    !blocked.contains(stream) && self.is_persisted(&checkpoint)
                }
                CheckpointScope::Global => !global_blocked && self.is_persisted(&checkpoint),
            };
            if !ready {
                match &checkpoint.message.scope {
                    CheckpointScope::Stream(stream) => {
                        blocked.insert(stream.clone());
                    }
                    CheckpointScope::Global => global_blocked = true,
                }
                kept.push_back(checkpoint);
                continue;
            }

            let checkpoint = checkpoint.into_inner();
            let covered: u64 = checkpoint.positions.values().sum();
            let mut message = checkpoint.message;
            message.destination_record_count = Some(covered);
            if let Err(err) = output.accept_checkpoint(message) {
                kept.extend(inner.pending.drain(..));
                inner.pending = kept;
                inner.emitted += emitted as u64;
                return Err(err);
            }
            emitted += 1;
        }

        inner.pending = kept;
        inner.emitted += emitted as u64;
        if emitted > 0 {
            debug!(emitted, pending = inner.pending.len(), "checkpoints flushed");
        }
        Ok(emitted)
    }

    /// Number of checkpoints not yet emitted.
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Number of checkpoints emitted so far.
    pub fn emitted_count(&self) -> u64 {
        self.inner.lock().emitted
    }

    /// Records that no more checkpoints will arrive.
    pub fn mark_input_drained(&self) {
        self.drained.send_replace(true);
    }

    /// Returns true once every checkpoint has been received.
    pub fn is_input_drained(&self) -> bool {
        *self.drained.borrow()
    }

    /// Suspends until no more checkpoints will arrive.
    pub async fn await_input_drained(&self) {
        let mut rx = self.drained.subscribe();
        let _ = rx.wait_for(|drained| *drained).await;
    }

    fn is_persisted(&self, checkpoint: &StampedCheckpoint) -> bool {
        checkpoint.positions.iter().all(|(stream, position)| {
            self.sync_manager
                .stream_manager(stream)
                .map(|manager| !manager.is_failed() && manager.records_persisted_until(*position))
                .unwrap_or(false)
        })
    }
}
