//! Data and control messages read by the destination.

use crate::catalog::StreamDescriptor;
use crate::checkpoint::{CheckpointMessage, CheckpointScope};
use serde::{Deserialize, Serialize};

/// A single record destined for one stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationRecord {
    /// Stream the record belongs to.
    pub stream: StreamDescriptor,
    /// Record payload.
    pub data: serde_json::Value,
    /// Source emission time in milliseconds since the epoch.
    pub emitted_at_ms: i64,
    /// Size of the record as it arrived on the wire.
    pub serialized_size: u64,
}

impl DestinationRecord {
    /// Creates a record, estimating its serialized size from the payload.
    pub fn new(stream: StreamDescriptor, data: serde_json::Value, emitted_at_ms: i64) -> Self {
        let serialized_size = serde_json::to_vec(&data)
            .map(|bytes| bytes.len() as u64)
            .unwrap_or(0);
        Self {
            stream,
            data,
            emitted_at_ms,
            serialized_size,
        }
    }
}

/// A whole file to transfer as-is, used instead of records in
/// file-transfer mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationFile {
    /// Stream the file belongs to.
    pub stream: StreamDescriptor,
    /// Location of the staged file on local disk.
    pub file_path: String,
    /// File size in bytes.
    pub size_bytes: u64,
    /// Source emission time in milliseconds since the epoch.
    pub emitted_at_ms: i64,
}

/// A deserialized message from the input flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputMessage {
    /// A data record.
    Record(DestinationRecord),
    /// A file reference (file-transfer mode).
    File(DestinationFile),
    /// No further data will arrive for the stream.
    EndOfStream {
        /// The completed stream.
        stream: StreamDescriptor,
    },
    /// A checkpoint.
    Checkpoint(CheckpointMessage),
}

impl InputMessage {
    /// Returns the stream the message targets, if it targets exactly one.
    pub fn stream(&self) -> Option<&StreamDescriptor> {
        match self {
            InputMessage::Record(record) => Some(&record.stream),
            InputMessage::File(file) => Some(&file.stream),
            InputMessage::EndOfStream { stream } => Some(stream),
            InputMessage::Checkpoint(checkpoint) => match &checkpoint.scope {
                CheckpointScope::Stream(stream) => Some(stream),
                CheckpointScope::Global => None,
            },
        }
    }

    /// Approximate in-memory footprint, used for memory reservations.
    pub fn size_hint(&self) -> u64 {
        match self {
            InputMessage::Record(record) => record.serialized_size,
            InputMessage::File(file) => file.file_path.len() as u64,
            InputMessage::EndOfStream { .. } => 0,
            InputMessage::Checkpoint(checkpoint) => serde_json::to_vec(&checkpoint.state)
                .map(|bytes| bytes.len() as u64)
                .unwrap_or(0),
        }
    }
}
