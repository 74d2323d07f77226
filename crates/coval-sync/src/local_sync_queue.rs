//! Local transactions sync queue.
//!
//! Local writes are batched per CoValue into one content message, but a
//! batch is closed as soon as a write to a different CoValue arrives. The
//! flushed messages therefore keep the order the writes happened in, so a
//! CoValue is never sent ahead of a group (or source) it depends on.

use std::collections::{BTreeSet, HashMap};

use coval_core::{CoValueId, NewContentMessage};

/// Handle returned by [`LocalTransactionsSyncQueue::track_dirty_co_values`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DirtyTracker(u64);

/// Ordered batches of local content waiting to be sent.
#[derive(Debug, Default)]
pub struct LocalTransactionsSyncQueue {
    /// Closed batches, oldest first.
    ready: Vec<NewContentMessage>,

    /// The batch still accepting writes.
    open: Option<NewContentMessage>,

    next_tracker: u64,
    trackers: HashMap<DirtyTracker, BTreeSet<CoValueId>>,
}

impl LocalTransactionsSyncQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue local content.
    ///
    /// Content for the CoValue of the open batch joins it; anything else
    /// closes the open batch first.
    pub fn push(&mut self, content: NewContentMessage) {
        for dirty in self.trackers.values_mut() {
            dirty.insert(content.id);
        }

        match &mut self.open {
            Some(open) if open.id == content.id => open.merge_from(content),
            _ => {
                if let Some(previous) = self.open.replace(content) {
                    self.ready.push(previous);
                }
            }
        }
    }

    /// Take every queued batch, in order.
    pub fn flush(&mut self) -> Vec<NewContentMessage> {
        let mut batches = std::mem::take(&mut self.ready);
        batches.extend(self.open.take());
        batches
    }

    pub fn is_empty(&self) -> bool {
        self.ready.is_empty() && self.open.is_none()
    }

    /// Start recording which CoValues get local writes.
    pub fn track_dirty_co_values(&mut self) -> DirtyTracker {
        let tracker = DirtyTracker(self.next_tracker);
        self.next_tracker += 1;
        self.trackers.insert(tracker, BTreeSet::new());
        tracker
    }

    /// Stop recording; returns the CoValues written since the tracker started.
    pub fn stop_tracking(&mut self, tracker: DirtyTracker) -> BTreeSet<CoValueId> {
        self.trackers.remove(&tracker).unwrap_or_default()
    }
}
