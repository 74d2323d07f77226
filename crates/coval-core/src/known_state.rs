//! Known state: what a party has for one CoValue.
//!
//! Session values are transaction counts. A count of `n` means indices
//! `0..n` are known, so combining two states is a per-session max.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::ids::{CoValueId, SessionId};

/// Per-session transaction counts.
pub type SessionCounts = BTreeMap<SessionId, u32>;

/// Compact summary two parties exchange to find missing content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownState {
    pub id: CoValueId,
    pub header: bool,
    #[serde(default)]
    pub sessions: SessionCounts,
}

impl KnownState {
    /// Nothing known about `id`.
    pub fn empty(id: CoValueId) -> Self {
        Self {
            id,
            header: false,
            sessions: BTreeMap::new(),
        }
    }

    /// Count known for `session` (0 if absent).
    pub fn count(&self, session: &SessionId) -> u32 {
        self.sessions.get(session).copied().unwrap_or(0)
    }

    /// Merge `other` into `self`: header OR, per-session max.
    pub fn combine_with(&mut self, other: &KnownState) {
        self.header |= other.header;
        combine_sessions(&mut self.sessions, &other.sessions);
    }

    /// Whether everything in `self` is also in `other`.
    pub fn is_subset_of(&self, other: &KnownState) -> bool {
        if self.header && !other.header {
            return false;
        }
        self.sessions
            .iter()
            .all(|(session, count)| *count <= other.count(session))
    }

    /// Sessions where `self` knows more than `other`, with `self`'s counts.
    pub fn sessions_diff(&self, other: &KnownState) -> SessionCounts {
        self.sessions
            .iter()
            .filter(|(session, count)| **count > other.count(session))
            .map(|(session, count)| (*session, *count))
            .collect()
    }
}

/// Whether `outer` has at least the counts of `inner` in every session.
pub fn sessions_cover(outer: &SessionCounts, inner: &SessionCounts) -> bool {
    inner
        .iter()
        .all(|(session, count)| outer.get(session).copied().unwrap_or(0) >= *count)
}

/// Per-session max of two session maps.
pub fn combine_sessions(into: &mut SessionCounts, other: &SessionCounts) {
    for (session, count) in other {
        let entry = into.entry(*session).or_insert(0);
        *entry = (*entry).max(*count);
    }
}
