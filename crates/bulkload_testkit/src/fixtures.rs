//! Message fixtures and test setup helpers.

use bulkload_engine::EngineConfig;
use bulkload_protocol::{
    CheckpointMessage, DestinationCatalog, DestinationFile, DestinationRecord, InputMessage,
    StreamDescriptor,
};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// A stream in the `public` namespace.
pub fn stream(name: &str) -> StreamDescriptor {
    StreamDescriptor::new("public", name)
}

/// A catalog of `public` streams.
pub fn catalog(names: &[&str]) -> DestinationCatalog {
    DestinationCatalog::new(names.iter().map(|name| stream(name)).collect())
        .expect("Fixture catalog has duplicate streams")
}

/// A record message with an `id` field.
pub fn record_message(stream: &StreamDescriptor, id: u64) -> InputMessage {
    InputMessage::Record(DestinationRecord::new(
        stream.clone(),
        serde_json::json!({ "id": id, "name": format!("row-{id}") }),
        1_700_000_000_000 + id as i64,
    ))
}

/// A file message for file-transfer syncs.
pub fn file_message(stream: &StreamDescriptor, name: &str) -> InputMessage {
    InputMessage::File(DestinationFile {
        stream: stream.clone(),
        file_path: format!("/staging/{}/{name}", stream.name),
        size_bytes: 1_024,
        emitted_at_ms: 1_700_000_000_000,
    })
}

/// `count` records for `stream` followed by its end-of-stream marker.
pub fn stream_messages(stream: &StreamDescriptor, count: u64) -> Vec<InputMessage> {
    let mut messages: Vec<_> = (0..count).map(|id| record_message(stream, id)).collect();
    messages.push(end_of_stream(stream));
    messages
}

/// End-of-stream marker.
pub fn end_of_stream(stream: &StreamDescriptor) -> InputMessage {
    InputMessage::EndOfStream {
        stream: stream.clone(),
    }
}

/// Stream checkpoint carrying `cursor` as its state.
pub fn stream_checkpoint(stream: &StreamDescriptor, cursor: u64) -> InputMessage {
    InputMessage::Checkpoint(CheckpointMessage::stream(
        stream.clone(),
        serde_json::json!({ "cursor": cursor }),
    ))
}

/// Global checkpoint carrying `cursor` as its state.
pub fn global_checkpoint(cursor: u64) -> InputMessage {
    InputMessage::Checkpoint(CheckpointMessage::global(serde_json::json!({ "cursor": cursor })))
}

/// Engine configuration with small spill files and short intervals so
/// tests finish quickly.
pub fn fast_config() -> EngineConfig {
    EngineConfig::new()
        .with_spill_limits(4, 64 * 1024)
        .with_spill_idle_flush(Duration::from_millis(20))
        .with_checkpoint_flush_interval(Duration::from_millis(10))
}

/// Installs a test-friendly tracing subscriber. Filtered by `RUST_LOG`;
/// safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_messages_end_with_marker() {
        let users = stream("users");
        let messages = stream_messages(&users, 3);
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[3], end_of_stream(&users));
        assert!(messages.iter().all(|message| message.stream() == Some(&users)));
    }

    #[test]
    fn fast_config_is_valid() {
        assert!(fast_config().validate().is_ok());
    }
}
