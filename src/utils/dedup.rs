//! Recently-seen message-id cache.
//!
//! A client that never hears a response retransmits the identical frame,
//! message id included. The server side runs every inbound request through
//! this cache to learn whether it is seeing the id for the first time
//! (`is_new`) or handling a retransmission; handlers use that to keep side
//! effects exactly-once while still acknowledging the retry.
//!
//! The cache is capacity-bounded with FIFO eviction so a long-lived
//! connection cannot grow it without bound.

use std::collections::{HashSet, VecDeque};

/// Bounded FIFO set of message ids already handled for one frame type.
#[derive(Debug)]
pub struct SeenCache {
    entries: HashSet<i64>,
    insertion_order: VecDeque<i64>,
    max_entries: usize,
}

impl SeenCache {
    /// Default capacity: plenty for the handful of in-flight requests a
    /// single connection can carry.
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            entries: HashSet::new(),
            insertion_order: VecDeque::new(),
            max_entries: max_entries.max(1),
        }
    }

    /// Record a message id, returning `true` if it was not seen before.
    pub fn check_new(&mut self, message_id: i64) -> bool {
        if self.entries.contains(&message_id) {
            return false;
        }

        if self.entries.len() >= self.max_entries {
            if let Some(oldest) = self.insertion_order.pop_front() {
                self.entries.remove(&oldest);
            }
        }

        self.entries.insert(message_id);
        self.insertion_order.push_back(message_id);
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for SeenCache {
    fn default() -> Self {
        Self::new()
    }
}
