//! Per-peer sync state.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use coval_core::{CoValueId, KnownState};

use crate::messages::SyncMessage;
use crate::transport::{PeerId, PeerRole};

/// What we believe one connected peer has.
///
/// `confirmed` only moves when the peer tells us something. `optimistic`
/// also moves when we send content, so the same content is not sent twice
/// while the peer hasn't acknowledged it yet.
#[derive(Debug)]
pub struct PeerState {
    id: PeerId,
    role: PeerRole,
    priority: u8,
    outgoing: Option<mpsc::UnboundedSender<SyncMessage>>,
    confirmed: HashMap<CoValueId, KnownState>,
    optimistic: HashMap<CoValueId, KnownState>,
    closed: bool,
}

impl PeerState {
    pub fn new(
        id: PeerId,
        role: PeerRole,
        priority: u8,
        outgoing: mpsc::UnboundedSender<SyncMessage>,
    ) -> Self {
        Self {
            id,
            role,
            priority,
            outgoing: Some(outgoing),
            confirmed: HashMap::new(),
            optimistic: HashMap::new(),
            closed: false,
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Known states
    // ─────────────────────────────────────────────────────────────────────────

    /// What the peer has told us it has for `id`.
    pub fn known_state(&self, id: &CoValueId) -> Option<&KnownState> {
        self.confirmed.get(id)
    }

    /// What the peer has or is about to have for `id`.
    pub fn optimistic_known_state(&self, id: &CoValueId) -> Option<&KnownState> {
        self.optimistic.get(id)
    }

    /// Whether the peer has shown interest in `id`.
    pub fn tracks(&self, id: &CoValueId) -> bool {
        self.confirmed.contains_key(id) || self.optimistic.contains_key(id)
    }

    /// Fold in something the peer told us.
    pub fn combine_known(&mut self, known: &KnownState) {
        combine_into(&mut self.confirmed, known);
        combine_into(&mut self.optimistic, known);
    }

    /// The peer corrected us: forget what we believed and take its word.
    pub fn replace_known(&mut self, known: &KnownState) {
        self.confirmed.insert(known.id, known.clone());
        self.optimistic.insert(known.id, known.clone());
    }

    /// Record content we just sent.
    pub fn combine_optimistic(&mut self, known: &KnownState) {
        combine_into(&mut self.optimistic, known);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Sending
    // ─────────────────────────────────────────────────────────────────────────

    /// Queue `msg` for the peer. Returns false if the peer is closed.
    ///
    /// A failed send marks the peer closed and drops optimistic state that
    /// will never be confirmed.
    pub fn send(&mut self, msg: SyncMessage) -> bool {
        let Some(outgoing) = &self.outgoing else {
            return false;
        };
        if outgoing.send(msg).is_err() {
            warn!(peer = %self.id, "peer channel closed");
            self.mark_closed();
            return false;
        }
        true
    }

    /// Close the outgoing channel. Messages already queued are still delivered.
    pub fn graceful_shutdown(&mut self) {
        debug!(peer = %self.id, "graceful shutdown");
        self.mark_closed();
    }

    /// Mark the peer gone.
    pub fn mark_closed(&mut self) {
        self.closed = true;
        self.outgoing = None;
        self.optimistic = self.confirmed.clone();
    }
}

fn combine_into(map: &mut HashMap<CoValueId, KnownState>, known: &KnownState) {
    map.entry(known.id)
        .or_insert_with(|| KnownState::empty(known.id))
        .combine_with(known);
}
