//! Configuration for the sync engine.

use crate::error::{SyncError, SyncResult};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for one sync run.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Transfer whole files instead of staging records.
    pub file_transfer: bool,
    /// Capacity of the shared record queue.
    pub record_queue_capacity: usize,
    /// Capacity of each per-stream input queue.
    pub spill_queue_capacity: usize,
    /// Capacity of the shared batch queue.
    pub batch_queue_capacity: usize,
    /// Capacity of the checkpoint queue.
    pub checkpoint_queue_capacity: usize,
    /// Memory budget shared by in-flight input messages.
    pub memory_budget_bytes: u64,
    /// Flush a spill file once it holds this many records.
    pub spill_max_records: u64,
    /// Flush a spill file once it holds this many bytes.
    pub spill_max_bytes: u64,
    /// Flush a non-empty spill file after this long without new records.
    pub spill_idle_flush: Duration,
    /// Directory for spill files. Uses the system temp dir when unset.
    pub spill_dir: Option<PathBuf>,
    /// Interval between checkpoint flush attempts.
    pub checkpoint_flush_interval: Duration,
}

impl EngineConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            file_transfer: false,
            record_queue_capacity: 1_024,
            spill_queue_capacity: 4,
            batch_queue_capacity: 64,
            checkpoint_queue_capacity: 1_024,
            memory_budget_bytes: 256 * 1024 * 1024,
            spill_max_records: 100_000,
            spill_max_bytes: 64 * 1024 * 1024,
            spill_idle_flush: Duration::from_secs(5),
            spill_dir: None,
            checkpoint_flush_interval: Duration::from_secs(1),
        }
    }

    /// Enables or disables file-transfer mode.
    pub fn with_file_transfer(mut self, enabled: bool) -> Self {
        self.file_transfer = enabled;
        self
    }

    /// Sets the per-stream input queue capacity.
    pub fn with_record_queue_capacity(mut self, capacity: usize) -> Self {
        self.record_queue_capacity = capacity;
        self
    }

    /// Sets the batch queue capacity.
    pub fn with_batch_queue_capacity(mut self, capacity: usize) -> Self {
        self.batch_queue_capacity = capacity;
        self
    }

    /// Sets the checkpoint queue capacity.
    pub fn with_checkpoint_queue_capacity(mut self, capacity: usize) -> Self {
        self.checkpoint_queue_capacity = capacity;
        self
    }

    /// Sets the memory budget for in-flight messages.
    pub fn with_memory_budget(mut self, bytes: u64) -> Self {
        self.memory_budget_bytes = bytes;
        self
    }

    /// Sets the spill thresholds.
    pub fn with_spill_limits(mut self, max_records: u64, max_bytes: u64) -> Self {
        self.spill_max_records = max_records;
        self.spill_max_bytes = max_bytes;
        self
    }

    /// Sets the spill idle flush timeout.
    pub fn with_spill_idle_flush(mut self, timeout: Duration) -> Self {
        self.spill_idle_flush = timeout;
        self
    }

    /// Sets the spill directory.
    pub fn with_spill_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spill_dir = Some(dir.into());
        self
    }

    /// Sets the checkpoint flush interval.
    pub fn with_checkpoint_flush_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_flush_interval = interval;
        self
    }

    /// Checks that every capacity and threshold is usable.
    pub fn validate(&self) -> SyncResult<()> {
        let capacities = [
            ("record_queue_capacity", self.record_queue_capacity),
            ("spill_queue_capacity", self.spill_queue_capacity),
            ("batch_queue_capacity", self.batch_queue_capacity),
            ("checkpoint_queue_capacity", self.checkpoint_queue_capacity),
        ];
        if let Some((name, _)) = capacities.iter().find(|(_, value)| *value == 0) {
            return Err(SyncError::Config(format!("{name} must be greater than zero")));
        }
        if self.memory_budget_bytes == 0 {
            return Err(SyncError::Config("memory_budget_bytes must be greater than zero".into()));
        }
        if self.spill_max_records == 0 || self.spill_max_bytes == 0 {
            return Err(SyncError::Config("spill limits must be greater than zero".into()));
        }
        if self.checkpoint_flush_interval.is_zero() {
            return Err(SyncError::Config(
                "checkpoint_flush_interval must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}
