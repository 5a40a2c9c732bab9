//! Property-based test generators using proptest.
//!
//! Strategies produce input that a well-behaved source could emit: every
//! stream's messages stay in order and each stream ends with exactly one
//! end-of-stream marker.

use crate::fixtures::{end_of_stream, record_message, stream};
use bulkload_protocol::{InputMessage, StreamDescriptor};
use proptest::prelude::*;

/// Strategy for generating valid stream names.
pub fn stream_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_]{0,15}").expect("Invalid regex")
}

/// Strategy for generating record payloads.
pub fn record_payload_strategy() -> impl Strategy<Value = serde_json::Value> {
    (any::<i64>(), "[a-zA-Z0-9 ]{0,24}", any::<bool>()).prop_map(|(id, name, active)| {
        serde_json::json!({ "id": id, "name": name, "active": active })
    })
}

/// Strategy for a sync plan: distinct streams with a record count each.
pub fn sync_plan_strategy(
    max_streams: usize,
    max_records: u64,
) -> impl Strategy<Value = Vec<(StreamDescriptor, u64)>> {
    prop::collection::btree_map(stream_name_strategy(), 0..=max_records, 1..=max_streams)
        .prop_map(|plan| {
            plan.into_iter()
                .map(|(name, count)| (stream(&name), count))
                .collect()
        })
}

/// Strategy for interleaved input following a sync plan.
pub fn interleaved_input_strategy(
    max_streams: usize,
    max_records: u64,
) -> impl Strategy<Value = (Vec<(StreamDescriptor, u64)>, Vec<InputMessage>)> {
    sync_plan_strategy(max_streams, max_records).prop_flat_map(|plan| {
        let total: u64 = plan.iter().map(|(_, count)| count + 1).sum();
        prop::collection::vec(any::<prop::sample::Index>(), total as usize).prop_map(
            move |picks| {
                let messages = interleave(&plan, &picks);
                (plan.clone(), messages)
            },
        )
    })
}

/// Interleaves per-stream messages, using `picks` to choose which stream
/// emits next.
pub fn interleave(
    plan: &[(StreamDescriptor, u64)],
    picks: &[prop::sample::Index],
) -> Vec<InputMessage> {
    let mut emitted = vec![0u64; plan.len()];
    let mut open: Vec<usize> = (0..plan.len()).collect();
    let mut messages = Vec::new();
    let mut picks = picks.iter();

    while !open.is_empty() {
        let slot = picks.next().map(|pick| pick.index(open.len())).unwrap_or(0);
        let i = open[slot];
        let (stream, count) = &plan[i];
        if emitted[i] < *count {
            messages.push(record_message(stream, emitted[i]));
            emitted[i] += 1;
        } else {
            messages.push(end_of_stream(stream));
            open.remove(slot);
        }
    }
    messages
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn interleaving_keeps_stream_order((plan, messages) in interleaved_input_strategy(4, 20)) {
            for (stream, count) in &plan {
                let own: Vec<_> = messages
                    .iter()
                    .filter(|message| message.stream() == Some(stream))
                    .collect();
                prop_assert_eq!(own.len() as u64, count + 1);
                prop_assert_eq!(own.last().copied(), Some(&end_of_stream(stream)));
                for (expected, message) in own.iter().take(*count as usize).enumerate() {
                    prop_assert_eq!(*message, &record_message(stream, expected as u64));
                }
            }
        }
    }
}
