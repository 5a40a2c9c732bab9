//! Disk staging.
//!
//! One task serves every stream: records are buffered per stream as JSON
//! lines and written to a temp file when the buffer reaches the record or
//! byte limit, when the stream ends, or when the stream has been idle for
//! the configured interval. The file then goes to the stream's input queue.

use crate::config::EngineConfig;
use crate::error::{SyncError, SyncResult};
use crate::launcher::TaskLauncher;
use crate::queue::{send_unless_failed, RecordEvent, SpilledFile, StreamInput};
use crate::reservation::Reserved;
use crate::stream_manager::StreamManager;
use bulkload_protocol::StreamDescriptor;
use std::collections::HashMap;
use std::io::Write;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::{NamedTempFile, TempPath};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

struct SpillBuffer {
    lines: Vec<u8>,
    records: Range<u64>,
    reservation: Reserved<()>,
    last_write: Instant,
}

impl SpillBuffer {
    fn new(first_index: u64) -> Self {
        Self {
            lines: Vec::new(),
            records: first_index..first_index,
            reservation: Reserved::unreserved(()),
            last_write: Instant::now(),
        }
    }

    fn is_full(&self, config: &EngineConfig) -> bool {
        self.records.end - self.records.start >= config.spill_max_records
            || self.lines.len() as u64 >= config.spill_max_bytes
    }
}

pub(super) async fn run(launcher: Arc<TaskLauncher>) -> SyncResult<()> {
    let config = launcher.config();
    let sync = launcher.sync_manager();
    let mut rx = launcher.queues().take_record_receiver()?;
    let senders = launcher.queues().take_stream_senders()?;
    let mut buffers: HashMap<StreamDescriptor, SpillBuffer> = HashMap::new();
    let mut idle = tokio::time::interval(config.spill_idle_flush);
    idle.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(RecordEvent::Record(record)) => {
                    let stream = record.record.stream.clone();
                    let manager = sync.stream_manager(&stream)?;
                    if manager.is_failed() {
                        buffers.remove(&stream);
                        continue;
                    }
                    let (indexed, reservation) = record.split();
                    let buffer = buffers
                        .entry(stream.clone())
                        .or_insert_with(|| SpillBuffer::new(indexed.index));
                    if indexed.index != buffer.records.end {
                        return Err(SyncError::illegal_state(format!(
                            "record {} of stream {stream} arrived out of order, expected {}",
                            indexed.index, buffer.records.end
                        )));
                    }
                    serde_json::to_writer(&mut buffer.lines, &indexed.record)?;
                    buffer.lines.push(b'\n');
                    buffer.records.end += 1;
                    buffer.reservation.absorb(reservation);
                    buffer.last_write = Instant::now();

                    if buffer.is_full(config) {
                        if let Some(buffer) = buffers.remove(&stream) {
                            flush(config, &senders, &manager, &stream, buffer).await?;
                        }
                    }
                }
                Some(RecordEvent::EndOfStream(stream)) => {
                    let manager = sync.stream_manager(&stream)?;
                    if let Some(buffer) = buffers.remove(&stream) {
                        flush(config, &senders, &manager, &stream, buffer).await?;
                    }
                    if let Some(tx) = senders.get(&stream) {
                        send_unless_failed(tx, &manager, StreamInput::EndOfStream, "stream input").await?;
                    }
                    debug!(stream = %stream, "stream fully staged");
                }
                None => break,
            },
            _ = idle.tick() => {
                let idle_streams: Vec<_> = buffers
                    .iter()
                    .filter(|(_, buffer)| buffer.last_write.elapsed() >= config.spill_idle_flush)
                    .map(|(stream, _)| stream.clone())
                    .collect();
                for stream in idle_streams {
                    let manager = sync.stream_manager(&stream)?;
                    if let Some(buffer) = buffers.remove(&stream) {
                        trace!(stream = %stream, "flushing idle spill buffer");
                        flush(config, &senders, &manager, &stream, buffer).await?;
                    }
                }
            }
        }
    }

    // Input ended without end-of-stream for these; the input task reports it.
    for (stream, buffer) in buffers {
        let manager = sync.stream_manager(&stream)?;
        flush(config, &senders, &manager, &stream, buffer).await?;
    }
    Ok(())
}

async fn flush(
    config: &EngineConfig,
    senders: &HashMap<StreamDescriptor, mpsc::Sender<StreamInput>>,
    manager: &StreamManager,
    stream: &StreamDescriptor,
    buffer: SpillBuffer,
) -> SyncResult<()> {
    if buffer.records.is_empty() || manager.is_failed() {
        return Ok(());
    }
    let tx = senders
        .get(stream)
        .ok_or_else(|| SyncError::UnknownStream(stream.clone()))?;
    let SpillBuffer {
        lines,
        records,
        reservation,
        ..
    } = buffer;
    let bytes = lines.len();
    let path = write_spill_file(config.spill_dir.clone(), lines).await?;
    debug!(stream = %stream, records = ?records, bytes, "spilled records to disk");
    let spilled = SpilledFile {
        path,
        records,
        reservation,
    };
    send_unless_failed(tx, manager, StreamInput::Spilled(spilled), "stream input").await?;
    Ok(())
}

async fn write_spill_file(dir: Option<PathBuf>, lines: Vec<u8>) -> SyncResult<TempPath> {
    tokio::task::spawn_blocking(move || -> SyncResult<TempPath> {
        let mut file = match dir {
            Some(dir) => NamedTempFile::new_in(dir)?,
            None => NamedTempFile::new()?,
        };
        file.write_all(&lines)?;
        file.flush()?;
        Ok(file.into_temp_path())
    })
    .await
    .map_err(|err| SyncError::illegal_state(format!("spill writer did not complete: {err}")))?
}
