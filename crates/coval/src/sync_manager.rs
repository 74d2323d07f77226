//! Sync manager: how the node talks to its peers.
//!
//! Every peer gets the same treatment: we track what it has (confirmed and
//! optimistic), and whenever we have something it lacks we send it, the
//! CoValues it depends on first. Server and storage peers are upstream:
//! loads fan out to them and every local write is pushed to them. Client
//! peers only get what they have shown interest in.
//!
//! Storage gets everything we hold. Other peers only get transactions whose
//! signatures have been checked and that are valid under the value's
//! permissions; a session is cut at its first transaction that is not.

use std::collections::HashSet;

use tracing::{debug, trace, warn};

use coval_core::{CoValueId, KnownState, NewContentMessage, SessionCounts, ValidationError};
use coval_sync::{KnownMessage, PeerId, PeerRole, PeerState, SyncMessage};

use crate::co_value_core::LoadOutcome;
use crate::state::{content_range, NodeState};

impl NodeState {
    // ─────────────────────────────────────────────────────────────────────────
    // Peers
    // ─────────────────────────────────────────────────────────────────────────

    /// Start tracking a freshly connected peer.
    pub(crate) fn connect_peer(&mut self, peer: PeerState, connection: u64) {
        let id = peer.id().clone();
        let upstream = peer.role().is_upstream();
        if let Some(mut old) = self.peers.insert(id.clone(), peer) {
            debug!(peer = %id, "replacing existing connection");
            old.graceful_shutdown();
        }
        self.connections.insert(id.clone(), connection);
        if upstream {
            self.announce_to(&id);
        }
    }

    /// Whether `connection` is the current connection of `peer`.
    pub(crate) fn is_current(&self, peer: &PeerId, connection: u64) -> bool {
        self.connections.get(peer) == Some(&connection)
    }

    /// Full reconciliation with a new upstream peer: load everything we
    /// hold, dependencies first, and join loads still in progress.
    fn announce_to(&mut self, peer_id: &PeerId) {
        for id in self.all_in_dependency_order() {
            let known = self.co_values.get(&id).map(|core| core.known_state());
            if let Some(known) = known {
                self.send(peer_id, SyncMessage::Load(known));
            }
        }

        let loading: Vec<CoValueId> = self
            .co_values
            .iter()
            .filter(|(_, core)| core.is_loading() && core.verified().is_none())
            .map(|(id, _)| *id)
            .collect();
        for id in loading {
            self.core_entry(id).add_pending(peer_id.clone());
            self.send(peer_id, SyncMessage::Load(KnownState::empty(id)));
        }
    }

    /// Forget a peer. Loads that were only waiting for it become unavailable.
    pub(crate) fn disconnect_peer(&mut self, peer_id: &PeerId, graceful: bool) {
        if let Some(mut peer) = self.peers.remove(peer_id) {
            if graceful {
                peer.graceful_shutdown();
            } else {
                peer.mark_closed();
            }
            debug!(peer = %peer_id, graceful, "peer removed");
        }
        self.connections.remove(peer_id);
        if let Some(reader) = self.readers.remove(peer_id) {
            reader.abort();
        }

        let ids: Vec<CoValueId> = self.co_values.keys().copied().collect();
        for id in ids {
            if let Some(requesters) = self.core_entry(id).peer_lacks(peer_id) {
                self.answer_unavailable(id, requesters);
            }
        }
    }

    /// Open upstream peers other than `except`, highest priority first.
    pub(crate) fn upstream_peers(&self, except: Option<&PeerId>) -> Vec<PeerId> {
        self.peers_by_priority(|peer| peer.role().is_upstream() && Some(peer.id()) != except)
    }

    fn peers_by_priority(&self, filter: impl Fn(&PeerState) -> bool) -> Vec<PeerId> {
        let mut peers: Vec<&PeerState> = self
            .peers
            .values()
            .filter(|peer| !peer.is_closed() && filter(peer))
            .collect();
        peers.sort_by(|a, b| b.priority().cmp(&a.priority()).then_with(|| a.id().cmp(b.id())));
        peers.into_iter().map(|peer| peer.id().clone()).collect()
    }

    pub(crate) fn send(&mut self, peer_id: &PeerId, msg: SyncMessage) -> bool {
        match self.peers.get_mut(peer_id) {
            Some(peer) => peer.send(msg),
            None => false,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Sending content
    // ─────────────────────────────────────────────────────────────────────────

    /// Send `peer_id` whatever it lacks of `id` and of the values `id`
    /// depends on. Returns whether anything was sent.
    pub(crate) fn sync_co_value(&mut self, peer_id: &PeerId, id: CoValueId) -> bool {
        let mut sent = false;
        for dep in self.dependencies_in_order(id) {
            sent |= self.send_missing(peer_id, dep);
        }
        sent | self.send_missing(peer_id, id)
    }

    /// Content of `id` beyond the peer's optimistic known state.
    fn send_missing(&mut self, peer_id: &PeerId, id: CoValueId) -> bool {
        let Some(role) = self.peers.get(peer_id).map(PeerState::role) else {
            return false;
        };
        let limits = match self.forward_limits(role, id) {
            Ok(limits) => limits,
            Err(e) => {
                debug!(%id, peer = %peer_id, error = %e, "not sending content");
                return false;
            }
        };
        let Some(verified) = self.co_values.get(&id).and_then(|core| core.verified()) else {
            return false;
        };
        let Some(peer) = self.peers.get_mut(peer_id) else {
            return false;
        };
        let known = peer.optimistic_known_state(&id).cloned();
        let Some(messages) = verified.new_content_within(known.as_ref(), limits.as_ref()) else {
            return false;
        };

        let mut sent = false;
        for msg in messages {
            let range = content_range(&msg);
            if !peer.send(SyncMessage::Content(msg)) {
                break;
            }
            peer.combine_optimistic(&range);
            sent = true;
        }
        sent
    }

    /// Per-session send limits of `id` for a peer with `role`; `None` means
    /// everything may go. Trusted content is checked first.
    fn forward_limits(
        &mut self,
        role: PeerRole,
        id: CoValueId,
    ) -> crate::Result<Option<SessionCounts>> {
        if role == PeerRole::Storage {
            return Ok(None);
        }
        self.verify_trusted(id);
        self.unforwardable_from(&id).map(Some)
    }

    /// Check signatures accepted on trust from storage.
    fn verify_trusted(&mut self, id: CoValueId) {
        let Some(verified) = self.co_values.get_mut(&id).and_then(|c| c.verified_mut()) else {
            return;
        };
        if verified.is_verified() {
            return;
        }
        if let Err(e) = verified.ensure_verified() {
            warn!(%id, error = %e, "trusted content failed verification");
        }
    }

    /// Send local writes queued since the last flush, in write order.
    pub(crate) fn flush_local(&mut self) {
        self.flush_scheduled = false;
        for batch in self.local_queue.flush() {
            let id = batch.id;
            let targets =
                self.peers_by_priority(|peer| peer.role().is_upstream() || peer.tracks(&id));
            for peer_id in targets {
                self.send_batch(&peer_id, &batch);
            }
        }
    }

    /// Send a local batch as is when it continues what the peer has,
    /// otherwise fall back to sending everything the peer lacks.
    fn send_batch(&mut self, peer_id: &PeerId, batch: &NewContentMessage) {
        for dep in self.dependencies_in_order(batch.id) {
            self.send_missing(peer_id, dep);
        }
        let Some(role) = self.peers.get(peer_id).map(PeerState::role) else {
            return;
        };
        let limited = match self.forward_limits(role, batch.id) {
            Ok(limits) => limits.map_or(false, |l| l.keys().any(|s| batch.new.contains_key(s))),
            Err(_) => true,
        };
        if limited {
            self.send_missing(peer_id, batch.id);
            return;
        }
        let Some(peer) = self.peers.get_mut(peer_id) else {
            return;
        };
        let continues = match peer.optimistic_known_state(&batch.id) {
            Some(known) => {
                (known.header || batch.header.is_some())
                    && batch
                        .new
                        .iter()
                        .all(|(session, content)| known.count(session) >= content.after)
            }
            None => batch.header.is_some() && batch.new.values().all(|c| c.after == 0),
        };
        if continues {
            let range = content_range(batch);
            if peer.send(SyncMessage::Content(batch.clone())) {
                peer.combine_optimistic(&range);
            }
        } else {
            self.send_missing(peer_id, batch.id);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Incoming messages
    // ─────────────────────────────────────────────────────────────────────────

    pub(crate) fn handle_message(&mut self, from: &PeerId, msg: SyncMessage) {
        if self.peers.get(from).map_or(true, PeerState::is_closed) {
            trace!(peer = %from, action = msg.action(), "dropping message from closed peer");
            return;
        }
        trace!(peer = %from, action = msg.action(), id = %msg.id(), "handling message");
        match msg {
            SyncMessage::Load(known) => self.handle_load(from, known),
            SyncMessage::Known(KnownMessage {
                known,
                is_correction,
            }) => self.handle_known(from, known, is_correction),
            SyncMessage::Content(content) => self.handle_content(from, content),
            SyncMessage::Done { id } => trace!(peer = %from, %id, "peer done"),
        }
    }

    fn handle_load(&mut self, from: &PeerId, known: KnownState) {
        let id = known.id;
        if let Some(peer) = self.peers.get_mut(from) {
            peer.replace_known(&known);
        }

        if self.known_state(&id).is_some() {
            if !self.sync_co_value(from, id) {
                let ours = self.core_entry(id).known_state();
                self.send(from, SyncMessage::known(ours));
            }
            return;
        }

        if self.core_entry(id).add_requester(from.clone()) {
            trace!(%id, peer = %from, "joined load in progress");
            return;
        }

        let asked = self.upstream_peers(Some(from));
        if asked.is_empty() {
            debug!(%id, peer = %from, "asked for unknown CoValue");
            self.core_entry(id).mark_unavailable();
            self.send(from, SyncMessage::known(KnownState::empty(id)));
            return;
        }
        debug!(%id, peer = %from, upstream = asked.len(), "forwarding load");
        self.core_entry(id)
            .start_loading(asked.iter().cloned().collect(), Some(from.clone()));
        for peer_id in &asked {
            self.send(peer_id, SyncMessage::Load(KnownState::empty(id)));
        }
    }

    fn handle_known(&mut self, from: &PeerId, known: KnownState, is_correction: bool) {
        let id = known.id;
        if let Some(peer) = self.peers.get_mut(from) {
            if is_correction {
                peer.replace_known(&known);
            } else {
                peer.combine_known(&known);
            }
        }

        if !known.header {
            if let Some(requesters) = self.co_values.get_mut(&id).and_then(|c| c.peer_lacks(from)) {
                self.answer_unavailable(id, requesters);
            }
        }
        if self.known_state(&id).is_some() {
            self.sync_co_value(from, id);
        }
    }

    fn handle_content(&mut self, from: &PeerId, content: NewContentMessage) {
        let id = content.id;
        let role = self.peers.get(from).map(PeerState::role);
        let trust = role == Some(PeerRole::Storage) && self.config.trust_storage_signatures;
        let checkpoint_bytes = self.config.signature_checkpoint_bytes;

        let had_header = self.known_state(&id).is_some();
        if !had_header {
            let Some(header) = content.header.clone() else {
                debug!(%id, peer = %from, "content without header for unknown CoValue");
                self.send(from, SyncMessage::correction(KnownState::empty(id)));
                return;
            };
            if let Err(e) = self.core_entry(id).set_header(header, checkpoint_bytes) {
                warn!(%id, peer = %from, error = %e, "rejected header");
                return;
            }
            self.link_dependencies(id);
        }

        let range = content_range(&content);
        let core = self.core_entry(id);
        let mut added = 0;
        let mut needs_correction = false;
        for (session, session_content) in content.new {
            match core.add_content(session, session_content, trust) {
                Ok(n) => added += n,
                Err(ValidationError::Gap { after, known, .. }) => {
                    debug!(%id, %session, after, known, "content gap, asking for earlier content");
                    needs_correction = true;
                }
                Err(e) => {
                    warn!(%id, %session, peer = %from, error = %e, "rejected content");
                    needs_correction = true;
                }
            }
        }
        if let Some(until) = &content.expect_content_until {
            core.expect_content(until);
        }
        core.settle_expectation();
        if trust && core.is_available() {
            // A finished load from storage is checked before anyone sees it.
            if let Some(verified) = core.verified_mut().filter(|v| !v.is_verified()) {
                if let Err(e) = verified.ensure_verified() {
                    warn!(%id, peer = %from, error = %e, "stored content failed verification");
                }
            }
        }
        let requesters = core.finish_loading();
        let ours = core.known_state();

        if let Some(peer) = self.peers.get_mut(from) {
            peer.combine_known(&range);
        }
        let reply = if needs_correction {
            SyncMessage::correction(ours.clone())
        } else {
            SyncMessage::known(ours.clone())
        };
        self.send(from, reply);

        if added > 0 || !had_header {
            self.forward(from, id);
            // Values held back until this one arrived may now be valid.
            let dependants: Vec<CoValueId> = self
                .co_values
                .get(&id)
                .map(|core| core.dependants().iter().copied().collect())
                .unwrap_or_default();
            for dependant in dependants {
                if self.known_state(&dependant).is_some() {
                    self.forward(from, dependant);
                }
            }
            self.subscriptions.notify(&ours);
        }
        for peer_id in requesters {
            self.sync_co_value(&peer_id, id);
        }
    }

    /// Pass new content of `id` on to interested peers other than `origin`.
    fn forward(&mut self, origin: &PeerId, id: CoValueId) {
        let targets = self.peers_by_priority(|peer| {
            peer.id() != origin && (peer.role().is_upstream() || peer.tracks(&id))
        });
        for peer_id in targets {
            self.sync_co_value(&peer_id, id);
        }
    }

    fn answer_unavailable(&mut self, id: CoValueId, requesters: HashSet<PeerId>) {
        debug!(%id, "unavailable");
        for peer_id in requesters {
            self.send(&peer_id, SyncMessage::known(KnownState::empty(id)));
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Loads started locally
    // ─────────────────────────────────────────────────────────────────────────

    /// Start loading `id` unless it is here or already on its way.
    /// Returns the outcome if it is already known.
    pub(crate) fn begin_load(&mut self, id: CoValueId) -> Option<LoadOutcome> {
        let core = self.core_entry(id);
        if core.is_available() {
            return Some(LoadOutcome::Available);
        }
        if core.is_loading() {
            return None;
        }

        let known = core.known_state();
        let asked = self.upstream_peers(None);
        if asked.is_empty() {
            debug!(%id, "no peers to load from");
            self.core_entry(id).mark_unavailable();
            return Some(LoadOutcome::Unavailable);
        }
        debug!(%id, peers = asked.len(), "loading");
        self.core_entry(id)
            .start_loading(asked.iter().cloned().collect(), None);
        for peer_id in &asked {
            self.send(peer_id, SyncMessage::Load(known.clone()));
        }
        None
    }

    /// Terminal availability of a load in progress, if reached.
    pub(crate) fn load_status(&self, id: &CoValueId) -> Option<LoadOutcome> {
        let core = self.co_values.get(id)?;
        if core.is_available() {
            Some(LoadOutcome::Available)
        } else if core.is_unavailable() {
            Some(LoadOutcome::Unavailable)
        } else {
            None
        }
    }

    pub(crate) fn load_timed_out(&mut self, id: CoValueId) {
        let requesters = self.core_entry(id).mark_unavailable();
        self.answer_unavailable(id, requesters);
    }

    /// Whether `peer_id` has confirmed everything we have of `id` that it
    /// may be sent.
    pub(crate) fn is_synced(&self, id: &CoValueId, peer_id: &PeerId) -> crate::Result<bool> {
        let peer = self
            .peers
            .get(peer_id)
            .filter(|peer| !peer.is_closed())
            .ok_or_else(|| coval_sync::SyncError::PeerNotConnected(peer_id.clone()))?;
        let verified = self
            .core(id)?
            .verified()
            .ok_or(crate::NodeError::NotFound(*id))?;
        let ours = match peer.role() {
            PeerRole::Storage => verified.known_state(),
            _ => verified.signed_known_state(Some(&self.unforwardable_from(id)?)),
        };
        Ok(peer
            .known_state(id)
            .map_or(false, |theirs| ours.is_subset_of(theirs)))
    }
}
