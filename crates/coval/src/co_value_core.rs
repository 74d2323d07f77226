//! One CoValue as held by a node.
//!
//! A core exists from the first time the node hears of an id. It has no
//! verified state until a header arrives (or is created locally), and it
//! tracks the progress of loads so that waiting callers and peers that
//! asked us can be answered once the outcome is known.

use std::collections::{BTreeSet, HashSet};

use coval_core::{
    CoValueHeader, CoValueId, KnownState, SessionCounts, SessionId, SessionNewContent,
    ValidationError, VerifiedState,
};
use coval_sync::PeerId;

/// Terminal outcome of loading a CoValue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Header and all announced content are here.
    Available,
    /// No reachable peer has it.
    Unavailable,
    /// It exists, but this agent may not read it.
    Unauthorized,
}

/// Progress of a load from peers.
#[derive(Debug, Default)]
enum Loading {
    #[default]
    Idle,
    /// Waiting for `pending` to answer. `requesters` are peers that asked
    /// us for this value while we didn't have it.
    Waiting {
        pending: HashSet<PeerId>,
        requesters: HashSet<PeerId>,
    },
    Unavailable,
}

/// A CoValue known to the node.
#[derive(Debug)]
pub struct CoValueCore {
    id: CoValueId,
    verified: Option<VerifiedState>,
    loading: Loading,
    /// Counts announced by the first chunk of a multi-part transfer.
    expect_content_until: Option<SessionCounts>,
    depends_on: BTreeSet<CoValueId>,
    dependants: BTreeSet<CoValueId>,
}

impl CoValueCore {
    /// A core for an id we have no content for yet.
    pub fn new(id: CoValueId) -> Self {
        Self {
            id,
            verified: None,
            loading: Loading::Idle,
            expect_content_until: None,
            depends_on: BTreeSet::new(),
            dependants: BTreeSet::new(),
        }
    }

    pub fn id(&self) -> CoValueId {
        self.id
    }

    pub fn verified(&self) -> Option<&VerifiedState> {
        self.verified.as_ref()
    }

    pub fn verified_mut(&mut self) -> Option<&mut VerifiedState> {
        self.verified.as_mut()
    }

    pub fn header(&self) -> Option<&CoValueHeader> {
        self.verified.as_ref().map(VerifiedState::header)
    }

    /// What we have; an empty state without header if nothing.
    pub fn known_state(&self) -> KnownState {
        self.verified
            .as_ref()
            .map_or_else(|| KnownState::empty(self.id), VerifiedState::known_state)
    }

    /// Header present and every announced chunk received.
    pub fn is_available(&self) -> bool {
        let Some(verified) = &self.verified else {
            return false;
        };
        let known = verified.known_state();
        self.expect_content_until.as_ref().map_or(true, |until| {
            until
                .iter()
                .all(|(session, count)| known.count(session) >= *count)
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Content
    // ─────────────────────────────────────────────────────────────────────────

    /// Install the header. Fails if it doesn't hash to our id.
    pub fn set_header(
        &mut self,
        header: CoValueHeader,
        checkpoint_bytes: usize,
    ) -> Result<(), ValidationError> {
        if self.verified.is_some() {
            return Ok(());
        }
        if header.id() != self.id {
            return Err(ValidationError::HeaderMismatch(self.id));
        }
        self.depends_on = header.dependencies().into_iter().collect();
        self.verified = Some(VerifiedState::with_checkpoint_bytes(header, checkpoint_bytes));
        Ok(())
    }

    /// Apply received content for one session; returns how many
    /// transactions were new.
    pub fn add_content(
        &mut self,
        session: SessionId,
        content: SessionNewContent,
        trust_signature: bool,
    ) -> Result<u32, ValidationError> {
        let verified = self
            .verified
            .as_mut()
            .ok_or(ValidationError::HeaderMismatch(self.id))?;
        verified.try_add_content(session, content, trust_signature)
    }

    /// Remember the counts a multi-part transfer will reach.
    pub fn expect_content(&mut self, until: &SessionCounts) {
        let expected = self.expect_content_until.get_or_insert_with(SessionCounts::new);
        coval_core::combine_sessions(expected, until);
        if self.is_available() {
            self.expect_content_until = None;
        }
    }

    /// Drop the expectation once it has been met.
    pub fn settle_expectation(&mut self) {
        if self.expect_content_until.is_some() && self.is_available() {
            self.expect_content_until = None;
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Dependencies
    // ─────────────────────────────────────────────────────────────────────────

    /// CoValues this one needs to be validated (owner group, branch source).
    pub fn depends_on(&self) -> &BTreeSet<CoValueId> {
        &self.depends_on
    }

    /// CoValues that depend on this one.
    pub fn dependants(&self) -> &BTreeSet<CoValueId> {
        &self.dependants
    }

    pub fn add_dependant(&mut self, id: CoValueId) {
        self.dependants.insert(id);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Loading
    // ─────────────────────────────────────────────────────────────────────────

    pub fn is_loading(&self) -> bool {
        matches!(self.loading, Loading::Waiting { .. })
    }

    /// Nobody had it the last time we asked.
    pub fn is_unavailable(&self) -> bool {
        !self.is_available() && matches!(self.loading, Loading::Unavailable)
    }

    /// Start waiting for `pending`.
    pub fn start_loading(&mut self, pending: HashSet<PeerId>, requester: Option<PeerId>) {
        self.loading = Loading::Waiting {
            pending,
            requesters: requester.into_iter().collect(),
        };
    }

    /// Record a peer to answer once the load finishes. Returns false if no
    /// load is in progress.
    pub fn add_requester(&mut self, peer: PeerId) -> bool {
        match &mut self.loading {
            Loading::Waiting { requesters, .. } => {
                requesters.insert(peer);
                true
            }
            _ => false,
        }
    }

    /// Also wait for `peer`.
    pub fn add_pending(&mut self, peer: PeerId) {
        if let Loading::Waiting { pending, .. } = &mut self.loading {
            pending.insert(peer);
        }
    }

    /// `peer` doesn't have it (or is gone). If that was the last peer we
    /// were waiting for, the value is unavailable and the requesters to
    /// tell are returned.
    pub fn peer_lacks(&mut self, peer: &PeerId) -> Option<HashSet<PeerId>> {
        let Loading::Waiting { pending, .. } = &mut self.loading else {
            return None;
        };
        pending.remove(peer);
        if !pending.is_empty() || self.is_available() {
            return None;
        }
        Some(self.mark_unavailable())
    }

    /// Give up; returns the requesters to tell.
    pub fn mark_unavailable(&mut self) -> HashSet<PeerId> {
        match std::mem::replace(&mut self.loading, Loading::Unavailable) {
            Loading::Waiting { requesters, .. } => requesters,
            _ => HashSet::new(),
        }
    }

    /// Finish a load that is now available; returns the requesters to
    /// send content to.
    pub fn finish_loading(&mut self) -> HashSet<PeerId> {
        if !self.is_available() {
            return HashSet::new();
        }
        match std::mem::take(&mut self.loading) {
            Loading::Waiting { requesters, .. } => requesters,
            _ => HashSet::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coval_core::{AgentSecret, CoValueType, Privacy, Ruleset};
    use serde_json::json;

    fn header() -> CoValueHeader {
        CoValueHeader::new_unique(CoValueType::CoMap, Ruleset::UnsafeAllowAll)
    }

    #[test]
    fn test_header_must_match_id() {
        let mut core = CoValueCore::new(CoValueId::from_bytes([1; 32]));
        assert!(matches!(
            core.set_header(header(), 1024),
            Err(ValidationError::HeaderMismatch(_))
        ));
        assert!(!core.is_available());

        let header = header();
        let mut core = CoValueCore::new(header.id());
        core.set_header(header, 1024).unwrap();
        assert!(core.is_available());
        assert!(core.known_state().header);
    }

    #[test]
    fn test_expectation_holds_back_availability() {
        let agent = AgentSecret::generate();
        let session = SessionId::new_random(agent.agent_id());
        let header = header();
        let mut source = VerifiedState::new(header.clone());
        for i in 0..2 {
            source
                .add_new_transaction(
                    session,
                    &[json!({"op": "set", "key": "k", "value": i})],
                    None,
                    Privacy::Trusting,
                    &agent.signer,
                    i,
                )
                .unwrap();
        }

        let mut core = CoValueCore::new(header.id());
        core.set_header(header, 1024).unwrap();
        core.expect_content(&source.known_state().sessions);
        assert!(!core.is_available());

        let mut content = source.new_content_since(None).unwrap().remove(0);
        let session_content = content.new.remove(&session).unwrap();
        assert_eq!(core.add_content(session, session_content, false).unwrap(), 2);
        core.settle_expectation();
        assert!(core.is_available());
    }

    #[test]
    fn test_loading_resolves_when_last_peer_lacks_it() {
        let mut core = CoValueCore::new(CoValueId::from_bytes([2; 32]));
        let a = PeerId::new("a");
        let b = PeerId::new("b");
        core.start_loading([a.clone(), b.clone()].into_iter().collect(), None);
        assert!(core.add_requester(PeerId::new("client")));

        assert!(core.peer_lacks(&a).is_none());
        let requesters = core.peer_lacks(&b).unwrap();
        assert!(requesters.contains(&PeerId::new("client")));
        assert!(core.is_unavailable());
        assert!(!core.add_requester(PeerId::new("late")));
    }
}
