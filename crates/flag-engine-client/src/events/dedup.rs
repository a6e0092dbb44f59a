//! Context deduplication for index events.

use std::collections::HashSet;

/// At-most-once tracking of fully-qualified context keys per flush interval.
///
/// The set is bounded: once full, deduplication is skipped entirely rather
/// than evicting, so events still flow and index events may repeat until the
/// next interval reset.
#[derive(Debug)]
pub struct ContextDeduplicator {
    seen: HashSet<String>,
    capacity: usize,
}

impl ContextDeduplicator {
    pub fn new(capacity: usize) -> ContextDeduplicator {
        ContextDeduplicator {
            seen: HashSet::with_capacity(capacity.min(1 << 16)),
            capacity,
        }
    }

    /// Records the key; returns true when it was already known (the caller
    /// skips the index event and counts a deduplication).
    pub fn notice(&mut self, fully_qualified_key: &str) -> bool {
        if self.seen.contains(fully_qualified_key) {
            return true;
        }
        if self.seen.len() < self.capacity {
            self.seen.insert(fully_qualified_key.to_string());
        }
        false
    }

    pub fn clear(&mut self) {
        self.seen.clear();
    }
}
