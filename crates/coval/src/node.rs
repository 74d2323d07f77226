//! The local node: registry of CoValues, owner of the sync manager.
//!
//! A [`LocalNode`] is a cheap clonable handle. Inbound messages from every
//! peer are funneled into one processor task that pulls them round-robin
//! and handles them one at a time; local writes are queued and flushed to
//! peers by the same task, once per scheduler turn.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use coval_core::{
    AgentId, AgentSecret, CoValueHeader, CoValueId, CoValueType, DecryptedTransaction,
    KnownState, NewContentMessage, PrivacyKind, Ruleset, SessionId, TransactionMeta,
};
use coval_store::StorageAdapter;
use coval_sync::{
    spawn_storage_peer, DirtyTracker, IncomingMessagesQueue, Peer, PeerId, PeerState,
    ProcessingBudget, SyncMessage,
};

use crate::co_value_core::LoadOutcome;
use crate::comap::RawCoMap;
use crate::config::NodeConfig;
use crate::error::{NodeError, Result};
use crate::refs::CoValueRef;
use crate::state::{NodeState, ValidTransactionsOptions};
use crate::subscription::Subscription;

/// Work for the processor task.
#[derive(Debug)]
pub(crate) enum NodeEvent {
    Incoming {
        peer: PeerId,
        connection: u64,
        msg: SyncMessage,
    },
    PeerClosed {
        peer: PeerId,
        connection: u64,
    },
    Flush,
}

pub(crate) struct NodeInner {
    state: Mutex<NodeState>,
    /// Signalled after every processed message and flush.
    changed: Notify,
}

impl NodeInner {
    pub(crate) fn lock(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A node holding CoValues for one agent.
#[derive(Clone)]
pub struct LocalNode {
    inner: Arc<NodeInner>,
    agent_id: AgentId,
}

impl LocalNode {
    /// Create a node for `agent` and start its processor task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(agent: AgentSecret, config: NodeConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let agent_id = agent.agent_id();
        let budget = config.sync.incoming_budget;
        let inner = Arc::new(NodeInner {
            state: Mutex::new(NodeState::new(agent, config, events_tx)),
            changed: Notify::new(),
        });
        tokio::spawn(run_processor(Arc::downgrade(&inner), events_rx, budget));
        debug!(agent = %agent_id, "node started");
        Self { inner, agent_id }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, NodeState> {
        self.inner.lock()
    }

    pub(crate) fn downgrade(&self) -> Weak<NodeInner> {
        Arc::downgrade(&self.inner)
    }

    /// The agent this node writes as.
    pub fn agent_id(&self) -> AgentId {
        self.agent_id
    }

    /// The session this node writes to.
    pub fn session_id(&self) -> SessionId {
        self.lock().session
    }

    pub fn config(&self) -> NodeConfig {
        self.lock().config.clone()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Peers
    // ─────────────────────────────────────────────────────────────────────────

    /// Connect a peer. Upstream peers (servers, storage) are immediately
    /// asked to load everything this node holds.
    pub fn add_peer(&self, peer: Peer) {
        let Peer {
            id,
            role,
            priority,
            incoming,
            outgoing,
        } = peer;
        debug!(peer = %id, role = role.as_str(), priority, "adding peer");

        let mut state = self.lock();
        let connection = state.next_connection;
        state.next_connection += 1;

        let reader = tokio::spawn(forward_incoming(
            id.clone(),
            connection,
            incoming,
            state.events.clone(),
        ));
        if let Some(old) = state.readers.insert(id.clone(), reader.abort_handle()) {
            old.abort();
        }
        state.connect_peer(PeerState::new(id, role, priority, outgoing), connection);
    }

    /// Serve `adapter` as this node's storage peer.
    pub fn add_storage<S>(&self, adapter: Arc<S>)
    where
        S: StorageAdapter + ?Sized + 'static,
    {
        let checkpoint_bytes = self.lock().config.signature_checkpoint_bytes;
        self.add_peer(spawn_storage_peer(adapter, "storage", checkpoint_bytes));
    }

    /// Disconnect a peer, dropping anything still queued for it.
    pub fn remove_peer(&self, peer: &PeerId) {
        self.lock().disconnect_peer(peer, false);
        self.inner.changed.notify_waiters();
    }

    /// Flush local writes, then close every peer. Messages already queued
    /// for a peer are still delivered.
    pub fn graceful_shutdown(&self) {
        let mut state = self.lock();
        state.flush_local();
        let peers: Vec<PeerId> = state.peers.keys().cloned().collect();
        for peer in peers {
            state.disconnect_peer(&peer, true);
        }
        drop(state);
        self.inner.changed.notify_waiters();
    }

    /// Send queued local writes now instead of on the next scheduler turn.
    pub fn flush(&self) {
        self.lock().flush_local();
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Creating and loading
    // ─────────────────────────────────────────────────────────────────────────

    /// Register a new CoValue with `header`.
    pub fn create_co_value(&self, header: CoValueHeader) -> Result<CoValueId> {
        self.lock().create_co_value(header)
    }

    /// Create a map owned by `owner`.
    pub fn create_map(&self, owner: CoValueId) -> Result<RawCoMap> {
        let header =
            CoValueHeader::new_unique(CoValueType::CoMap, Ruleset::OwnedByGroup { group: owner });
        let id = self.create_co_value(header)?;
        Ok(RawCoMap::new(self.clone(), id))
    }

    /// A map view of `id`.
    pub fn co_map(&self, id: CoValueId) -> Result<RawCoMap> {
        let co_type = self.lock().header(&id)?.co_type;
        if co_type != CoValueType::CoMap {
            return Err(NodeError::InvalidOperation(format!(
                "{id} is a {}, not a comap",
                co_type.as_str()
            )));
        }
        Ok(RawCoMap::new(self.clone(), id))
    }

    /// Load `id` and everything it depends on, from peers if needed.
    pub async fn load(&self, id: CoValueId) -> Result<LoadOutcome> {
        let deadline = Instant::now() + self.lock().config.load_timeout;

        let mut queue = vec![id];
        let mut seen = std::collections::HashSet::new();
        while let Some(next) = queue.pop() {
            if !seen.insert(next) {
                continue;
            }
            match self.load_one(next, deadline).await {
                LoadOutcome::Available => {
                    let state = self.lock();
                    queue.extend(state.core(&next)?.depends_on().iter().copied());
                }
                outcome if next == id => return Ok(outcome),
                _ => debug!(%id, dependency = %next, "dependency unavailable"),
            }
        }

        let outcome = self.lock().read_outcome(&id)?;
        debug!(%id, ?outcome, "loaded");
        Ok(outcome)
    }

    async fn load_one(&self, id: CoValueId, deadline: Instant) -> LoadOutcome {
        if let Some(outcome) = self.lock().begin_load(id) {
            return outcome;
        }
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(outcome) = self.lock().load_status(&id) {
                return outcome;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                warn!(%id, "load timed out");
                self.lock().load_timed_out(id);
                return LoadOutcome::Unavailable;
            }
        }
    }

    /// Load `id`, failing unless it is available and readable.
    pub(crate) async fn require(&self, id: CoValueId) -> Result<()> {
        match self.load(id).await? {
            LoadOutcome::Available => Ok(()),
            LoadOutcome::Unavailable => Err(NodeError::Unavailable(id)),
            LoadOutcome::Unauthorized => Err(NodeError::NotAuthorized(format!(
                "{} may not read {id}",
                self.agent_id
            ))),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reading and writing
    // ─────────────────────────────────────────────────────────────────────────

    /// Append a transaction to this node's session of `id`.
    pub fn make_transaction(
        &self,
        id: CoValueId,
        changes: Vec<Value>,
        privacy: PrivacyKind,
        meta: Option<TransactionMeta>,
    ) -> Result<KnownState> {
        self.lock()
            .make_transaction(&id, &changes, privacy, meta.as_ref())
    }

    /// Privacy new writes to `id` get when the caller doesn't choose.
    pub fn default_privacy(&self, id: CoValueId) -> Result<PrivacyKind> {
        self.lock().default_privacy(&id)
    }

    /// Valid, decrypted transactions of `id` in replay order.
    pub fn get_valid_transactions(
        &self,
        id: CoValueId,
        opts: &ValidTransactionsOptions,
    ) -> Result<Vec<DecryptedTransaction>> {
        self.lock().valid_transactions(&id, opts)
    }

    /// What this node has of `id`, if it has the header.
    pub fn known_state(&self, id: CoValueId) -> Option<KnownState> {
        self.lock().known_state(&id)
    }

    pub fn header(&self, id: CoValueId) -> Result<CoValueHeader> {
        Ok(self.lock().header(&id)?.clone())
    }

    /// Content the holder of `known` is missing.
    pub fn new_content_since(
        &self,
        id: CoValueId,
        known: Option<&KnownState>,
    ) -> Result<Option<Vec<NewContentMessage>>> {
        let state = self.lock();
        let verified = state.core(&id)?.verified().ok_or(NodeError::NotFound(id))?;
        Ok(verified.new_content_since(known))
    }

    /// A handle to `id` that is resolved explicitly.
    pub fn reference(&self, id: CoValueId) -> CoValueRef {
        CoValueRef::new(self.clone(), id)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Change tracking
    // ─────────────────────────────────────────────────────────────────────────

    /// Subscribe to changes of `id`. The current state is delivered first
    /// if the value is loaded.
    pub fn subscribe(&self, id: CoValueId) -> Subscription {
        let mut state = self.lock();
        let current = state.known_state(&id);
        let (key, receiver) = state.subscriptions.add(id, current.as_ref());
        Subscription::new(id, key, receiver, self.downgrade())
    }

    /// Number of live subscriptions to `id`.
    pub fn subscriber_count(&self, id: CoValueId) -> usize {
        self.lock().subscriptions.count(&id)
    }

    /// Start recording which CoValues get local writes.
    pub fn track_dirty_co_values(&self) -> DirtyTracker {
        self.lock().local_queue.track_dirty_co_values()
    }

    /// Stop recording; returns the CoValues written since `tracker` started.
    pub fn stop_tracking_dirty_co_values(
        &self,
        tracker: DirtyTracker,
    ) -> std::collections::BTreeSet<CoValueId> {
        self.lock().local_queue.stop_tracking(tracker)
    }

    /// Wait until `peer` has confirmed everything this node has of `id`.
    pub async fn wait_for_sync(&self, id: CoValueId, peer: &PeerId) -> Result<()> {
        let timeout = self.lock().config.load_timeout;
        self.wait_for_sync_within(id, peer, timeout).await
    }

    pub async fn wait_for_sync_within(
        &self,
        id: CoValueId,
        peer: &PeerId,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.lock().is_synced(&id, peer)? {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(NodeError::Timeout(format!("{id} not synced with {peer}")));
            }
        }
    }
}

/// Pump one peer's incoming channel into the node's event queue.
async fn forward_incoming(
    peer: PeerId,
    connection: u64,
    mut incoming: mpsc::UnboundedReceiver<SyncMessage>,
    events: mpsc::UnboundedSender<NodeEvent>,
) {
    while let Some(msg) = incoming.recv().await {
        let event = NodeEvent::Incoming {
            peer: peer.clone(),
            connection,
            msg,
        };
        if events.send(event).is_err() {
            return;
        }
    }
    let _ = events.send(NodeEvent::PeerClosed { peer, connection });
}

/// The node's single message loop.
async fn run_processor(
    node: Weak<NodeInner>,
    mut events: mpsc::UnboundedReceiver<NodeEvent>,
    budget: Duration,
) {
    let mut queue = Incoming::new();
    let mut budget = ProcessingBudget::new(budget);

    while let Some(event) = events.recv().await {
        budget.reset();
        let Some(inner) = node.upgrade() else {
            break;
        };
        accept(&inner, &mut queue, event);

        loop {
            while let Ok(event) = events.try_recv() {
                accept(&inner, &mut queue, event);
            }
            {
                let mut state = inner.lock();
                let Some((peer, msg)) = pull_current(&state, &mut queue) else {
                    break;
                };
                state.handle_message(&peer, msg);
            }
            inner.changed.notify_waiters();
            budget.tick().await;
        }
    }
    debug!("node processor stopped");
}

/// Messages waiting for the processor, tagged with their connection.
type Incoming = IncomingMessagesQueue<(u64, SyncMessage)>;

/// Next queued message that came in on its peer's current connection.
///
/// A peer can reconnect while messages from its old connection are still
/// queued; those are dropped here.
fn pull_current(state: &NodeState, queue: &mut Incoming) -> Option<(PeerId, SyncMessage)> {
    while let Some((peer, (connection, msg))) = queue.pull() {
        if state.is_current(&peer, connection) {
            return Some((peer, msg));
        }
        trace!(%peer, connection, action = msg.action(), "dropping message from old connection");
    }
    None
}

fn accept(inner: &NodeInner, queue: &mut Incoming, event: NodeEvent) {
    match event {
        NodeEvent::Incoming {
            peer,
            connection,
            msg,
        } => {
            if inner.lock().is_current(&peer, connection) {
                queue.push(peer, (connection, msg));
            }
        }
        NodeEvent::PeerClosed { peer, connection } => {
            let mut state = inner.lock();
            if state.is_current(&peer, connection) {
                debug!(%peer, "peer closed");
                queue.remove_peer(&peer);
                state.disconnect_peer(&peer, false);
                drop(state);
                inner.changed.notify_waiters();
            }
        }
        NodeEvent::Flush => {
            inner.lock().flush_local();
            inner.changed.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn done(n: u8) -> SyncMessage {
        SyncMessage::Done {
            id: CoValueId::from_bytes([n; 32]),
        }
    }

    #[test]
    fn test_queued_messages_from_old_connection_are_dropped() {
        let (events, _rx) = mpsc::unbounded_channel();
        let mut state = NodeState::new(AgentSecret::generate(), NodeConfig::default(), events);
        let server = PeerId::new("server");
        let other = PeerId::new("other");

        let mut queue = Incoming::new();
        state.connections.insert(server.clone(), 0);
        state.connections.insert(other.clone(), 5);
        queue.push(server.clone(), (0, done(1)));
        queue.push(other.clone(), (5, done(2)));
        queue.push(server.clone(), (0, done(3)));
        // The server reconnects before the processor gets to its messages.
        state.connections.insert(server.clone(), 1);
        queue.push(server.clone(), (1, done(4)));

        let pulled: Vec<(PeerId, CoValueId)> = std::iter::from_fn(|| pull_current(&state, &mut queue))
            .map(|(peer, msg)| (peer, msg.id()))
            .collect();
        assert_eq!(
            pulled,
            vec![
                (other, CoValueId::from_bytes([2; 32])),
                (server, CoValueId::from_bytes([4; 32])),
            ]
        );
        assert!(queue.is_empty());
    }
}
