//! Sets of record-index ranges.

use std::collections::BTreeMap;
use std::ops::Range;

/// A set of half-open `u64` ranges, kept merged.
///
/// Used to track which record indexes of a stream have reached a given
/// batch state. Adjacent and overlapping ranges coalesce on insert.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeSet {
    /// start -> end (exclusive); never overlapping or touching.
    ranges: BTreeMap<u64, u64>,
}

impl RangeSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a range, merging with neighbours.
    pub fn insert(&mut self, range: Range<u64>) {
        if range.start >= range.end {
            return;
        }
        let mut start = range.start;
        let mut end = range.end;

        // A range starting before `start` may reach into it.
        if let Some((&prev_start, &prev_end)) = self.ranges.range(..=start).next_back() {
            if prev_end >= start {
                start = prev_start;
                end = end.max(prev_end);
            }
        }

        let absorbed: Vec<u64> = self
            .ranges
            .range(start..=end)
            .map(|(&s, _)| s)
            .collect();
        for s in absorbed {
            if let Some(e) = self.ranges.remove(&s) {
                end = end.max(e);
            }
        }

        self.ranges.insert(start, end);
    }

    /// Returns true if every index in `range` is in the set.
    pub fn encloses(&self, range: Range<u64>) -> bool {
        if range.start >= range.end {
            return true;
        }
        match self.ranges.range(..=range.start).next_back() {
            Some((_, &end)) => end >= range.end,
            None => false,
        }
    }

    /// Returns true if `index` is in the set.
    pub fn contains(&self, index: u64) -> bool {
        self.encloses(index..index + 1)
    }

    /// Total number of indexes in the set.
    pub fn len(&self) -> u64 {
        self.ranges.iter().map(|(start, end)| end - start).sum()
    }

    /// Returns true if the set holds no indexes.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Iterates over the merged ranges in order.
    pub fn iter(&self) -> impl Iterator<Item = Range<u64>> + '_ {
        self.ranges.iter().map(|(&start, &end)| start..end)
    }
}
