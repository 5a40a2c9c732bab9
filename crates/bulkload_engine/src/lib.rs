//! # Bulkload Engine
//!
//! Task orchestration for a bulkload destination sync.
//!
//! This crate provides:
//! - Per-stream and sync-wide state machines
//! - A task model with stream/sync levels and exception scopes
//! - Exception handling that turns task failures into remediation tasks
//! - The task launcher that sequences the pipeline
//! - Bounded queues, memory reservations and checkpoint ordering
//! - The default pipeline tasks behind a `TaskFactory`
//!
//! ## Architecture
//!
//! A sync moves every catalog stream through the same pipeline:
//! 1. Setup prepares the destination and opens one loader per stream
//! 2. Input is read, counted per stream and staged to disk
//! 3. Staged data becomes batches that loaders advance to completion
//! 4. A stream closes once end-of-stream was seen and every batch completed
//! 5. Teardown runs once every stream closed or was failed
//!
//! ## Key Invariants
//!
//! - One failing stream does not fail the sync; every stream failing does
//! - Each stream failure is remediated exactly once
//! - Sync failure remediation runs at most once
//! - Checkpoints are emitted only after the records they cover are durable
//! - Teardown always runs

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod batch;
mod checkpoint;
mod config;
mod destination;
mod error;
mod exception;
mod launcher;
mod queue;
mod range_set;
mod reservation;
mod scope;
mod stream_manager;
mod sync_manager;
mod task;
mod tasks;

#[cfg(test)]
mod testing;

pub use batch::{Batch, BatchEnvelope, BatchId, BatchState};
pub use checkpoint::CheckpointManager;
pub use config::EngineConfig;
pub use destination::{Destination, InputFlow, OutputConsumer, StreamLoader};
pub use error::{SharedError, SyncError, SyncResult};
pub use exception::{FailureCallback, TaskExceptionHandler};
pub use launcher::TaskLauncher;
pub use queue::{
    IndexedFile, IndexedRecord, PipelineQueues, RecordEvent, SpilledFile, StampedCheckpoint,
    StreamInput,
};
pub use range_set::RangeSet;
pub use reservation::{ReservationManager, Reserved};
pub use scope::TaskScopeProvider;
pub use stream_manager::{StreamManager, StreamResult, StreamStatus, TerminalListener};
pub use sync_manager::{StreamSummary, SyncManager, SyncStatus, SyncSummary};
pub use task::{Task, TaskFuture, TaskKind, TaskLevel, TaskScope, Termination, WrappedTask};
pub use tasks::{DefaultTaskFactory, TaskFactory};
