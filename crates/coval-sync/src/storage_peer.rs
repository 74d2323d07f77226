//! A storage adapter served as a peer.
//!
//! The node talks to storage the same way it talks to a sync server: it
//! sends `load` and `content`, storage answers with `content` and `known`.
//! Loaded content is preceded by the content of every CoValue it depends
//! on, so the node can always validate what it receives.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use coval_core::{CoValueId, KnownState};
use coval_store::persistence::{self, StoreOutcome};
use coval_store::StorageAdapter;

use crate::error::Result;
use crate::messages::{KnownMessage, SyncMessage};
use crate::transport::{connected_peers, Peer, PeerId, PeerRole};

/// Serves a [`StorageAdapter`] over a peer connection.
pub struct StoragePeer<S: StorageAdapter + ?Sized> {
    adapter: Arc<S>,
    checkpoint_bytes: usize,
    outgoing: mpsc::UnboundedSender<SyncMessage>,
    /// What we believe the node has, per CoValue.
    node_known: HashMap<CoValueId, KnownState>,
}

/// Start a storage task for `adapter` and return the peer to hand to a node.
pub fn spawn_storage_peer<S>(adapter: Arc<S>, id: impl Into<PeerId>, checkpoint_bytes: usize) -> Peer
where
    S: StorageAdapter + ?Sized + 'static,
{
    let (storage_side, node_side) = connected_peers(id, "node", PeerRole::Storage, PeerRole::Client);
    let Peer {
        incoming, outgoing, ..
    } = node_side;

    let peer = StoragePeer {
        adapter,
        checkpoint_bytes,
        outgoing,
        node_known: HashMap::new(),
    };
    tokio::spawn(peer.run(incoming));
    storage_side
}

impl<S: StorageAdapter + ?Sized> StoragePeer<S> {
    async fn run(mut self, mut incoming: mpsc::UnboundedReceiver<SyncMessage>) {
        while let Some(msg) = incoming.recv().await {
            let id = msg.id();
            let action = msg.action();
            if let Err(e) = self.handle(msg).await {
                warn!(%id, action, error = %e, "storage peer failed to handle message");
            }
        }
        debug!("storage peer stopped");
    }

    async fn handle(&mut self, msg: SyncMessage) -> Result<()> {
        match msg {
            SyncMessage::Load(known) => self.handle_load(known).await,
            SyncMessage::Known(KnownMessage {
                known,
                is_correction,
            }) => {
                if is_correction {
                    self.node_known.insert(known.id, known.clone());
                } else {
                    self.remember(&known);
                }
                self.send_missing(known.id).await.map(|_| ())
            }
            SyncMessage::Content(content) => {
                let sent = KnownState {
                    id: content.id,
                    header: content.header.is_some(),
                    sessions: content
                        .new
                        .iter()
                        .map(|(session, c)| (*session, c.count_after()))
                        .collect(),
                };
                self.remember(&sent);

                let outcome =
                    persistence::store_new_content(&*self.adapter, &content, self.checkpoint_bytes)
                        .await?;
                match outcome {
                    StoreOutcome::Stored(known) => self.send(SyncMessage::known(known)),
                    StoreOutcome::NeedsCorrection(known) => {
                        for session in persistence::rejected_sessions(&content, &known) {
                            debug!(id = %content.id, %session, "storage asks for earlier content");
                        }
                        self.node_known.insert(known.id, known.clone());
                        self.send(SyncMessage::correction(known))
                    }
                }
                Ok(())
            }
            SyncMessage::Done { .. } => Ok(()),
        }
    }

    async fn handle_load(&mut self, known: KnownState) -> Result<()> {
        let id = known.id;
        // A load says what the node has now, not what it had before.
        self.node_known.insert(id, known);

        if self.adapter.get_co_value(&id).await?.is_none() {
            debug!(%id, "not in storage");
            self.send(SyncMessage::known(KnownState::empty(id)));
            return Ok(());
        }

        for dependency in self.dependencies(id).await? {
            self.send_missing(dependency).await?;
        }
        if !self.send_missing(id).await? {
            let stored = persistence::known_state(&*self.adapter, &id).await?;
            self.send(SyncMessage::known(stored));
        }
        Ok(())
    }

    /// Send whatever the node lacks for `id`. Returns whether anything was sent.
    async fn send_missing(&mut self, id: CoValueId) -> Result<bool> {
        let known = self.node_known.get(&id).cloned();
        let Some(messages) = persistence::load_content(&*self.adapter, &id, known.as_ref()).await?
        else {
            return Ok(false);
        };

        let mut sent = false;
        for msg in messages.into_iter().filter(|m| !m.is_empty()) {
            let after = KnownState {
                id,
                header: true,
                sessions: msg
                    .new
                    .iter()
                    .map(|(session, c)| (*session, c.count_after()))
                    .collect(),
            };
            self.remember(&after);
            self.send(SyncMessage::Content(msg));
            sent = true;
        }
        Ok(sent)
    }

    /// Stored CoValues `id` depends on, dependencies first.
    async fn dependencies(&self, id: CoValueId) -> Result<Vec<CoValueId>> {
        let mut order = Vec::new();
        let mut seen = HashSet::new();
        let mut stack = vec![(id, false)];

        while let Some((next, expanded)) = stack.pop() {
            if expanded {
                if next != id {
                    order.push(next);
                }
                continue;
            }
            if !seen.insert(next) {
                continue;
            }
            stack.push((next, true));
            if let Some(row) = self.adapter.get_co_value(&next).await? {
                for dep in row.header.dependencies() {
                    if !seen.contains(&dep) {
                        stack.push((dep, false));
                    }
                }
            }
        }
        Ok(order)
    }

    fn remember(&mut self, known: &KnownState) {
        self.node_known
            .entry(known.id)
            .or_insert_with(|| KnownState::empty(known.id))
            .combine_with(known);
    }

    fn send(&self, msg: SyncMessage) {
        if self.outgoing.send(msg).is_err() {
            debug!("node side of storage peer is gone");
        }
    }
}
