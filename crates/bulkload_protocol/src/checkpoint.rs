//! Checkpoint messages.

use crate::catalog::StreamDescriptor;
use serde::{Deserialize, Serialize};

/// What a checkpoint covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointScope {
    /// Progress for a single stream.
    Stream(StreamDescriptor),
    /// Progress across every stream in the sync.
    Global,
}

/// A durable marker of replication progress.
///
/// The source emits checkpoints interleaved with records. A destination may
/// only echo a checkpoint back once every record that preceded it has been
/// persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMessage {
    /// Stream or global scope.
    pub scope: CheckpointScope,
    /// Opaque source state to hand back on resume.
    pub state: serde_json::Value,
    /// Number of records the source emitted since the previous checkpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_record_count: Option<u64>,
    /// Number of records the destination persisted for this checkpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_record_count: Option<u64>,
}

impl CheckpointMessage {
    /// Creates a stream-scoped checkpoint.
    pub fn stream(stream: StreamDescriptor, state: serde_json::Value) -> Self {
        Self {
            scope: CheckpointScope::Stream(stream),
            state,
            source_record_count: None,
            destination_record_count: None,
        }
    }

    /// Creates a global checkpoint.
    pub fn global(state: serde_json::Value) -> Self {
        Self {
            scope: CheckpointScope::Global,
            state,
            source_record_count: None,
            destination_record_count: None,
        }
    }

    /// Sets the source record count.
    pub fn with_source_record_count(mut self, count: u64) -> Self {
        self.source_record_count = Some(count);
        self
    }

    /// Returns true for global checkpoints.
    pub fn is_global(&self) -> bool {
        matches!(self.scope, CheckpointScope::Global)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn destination_count_omitted_until_set() {
        let cp = CheckpointMessage::stream(StreamDescriptor::unnamespaced("users"), json!({"cursor": 5}));
        let encoded = serde_json::to_value(&cp).unwrap();
        assert!(encoded.get("destination_record_count").is_none());
        assert!(!cp.is_global());
    }

    #[test]
    fn global_scope() {
        let cp = CheckpointMessage::global(json!(null)).with_source_record_count(12);
        assert!(cp.is_global());
        assert_eq!(cp.source_record_count, Some(12));
    }
}
