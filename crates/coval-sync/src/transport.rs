//! Peer transport channels.
//!
//! A [`Peer`] is the node's end of a connection: an incoming stream of
//! messages and an outgoing sink, both plain tokio channels. Real
//! transports (WebSockets, HTTP relays) pump bytes into and out of these
//! channels; tests use [`connected_peers`] to wire two nodes directly.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::messages::SyncMessage;

/// Identifies a peer connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// What a peer is to us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    /// Another node that loads from us.
    Client,
    /// A sync server we load from and push to.
    Server,
    /// Durable storage.
    Storage,
}

impl PeerRole {
    /// Storage first, then servers, then clients.
    pub fn default_priority(self) -> u8 {
        match self {
            PeerRole::Storage => 100,
            PeerRole::Server => 50,
            PeerRole::Client => 0,
        }
    }

    /// Whether we load from and always push to this peer.
    pub fn is_upstream(self) -> bool {
        matches!(self, PeerRole::Server | PeerRole::Storage)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PeerRole::Client => "client",
            PeerRole::Server => "server",
            PeerRole::Storage => "storage",
        }
    }
}

/// One end of a peer connection, ready to hand to a node.
#[derive(Debug)]
pub struct Peer {
    pub id: PeerId,
    pub role: PeerRole,
    pub priority: u8,
    /// Messages the peer sent us. `None` from `recv` means the peer is gone.
    pub incoming: mpsc::UnboundedReceiver<SyncMessage>,
    /// Messages for the peer.
    pub outgoing: mpsc::UnboundedSender<SyncMessage>,
}

impl Peer {
    /// A peer over existing channels, with the role's default priority.
    pub fn new(
        id: impl Into<PeerId>,
        role: PeerRole,
        incoming: mpsc::UnboundedReceiver<SyncMessage>,
        outgoing: mpsc::UnboundedSender<SyncMessage>,
    ) -> Self {
        Self {
            id: id.into(),
            role,
            priority: role.default_priority(),
            incoming,
            outgoing,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Two linked in-memory peers.
///
/// Returns `(peer1, peer2)`: `peer1` is node 1 as seen by node 2 (hand it
/// to node 2), and `peer2` is node 2 as seen by node 1.
pub fn connected_peers(
    peer1_id: impl Into<PeerId>,
    peer2_id: impl Into<PeerId>,
    peer1_role: PeerRole,
    peer2_role: PeerRole,
) -> (Peer, Peer) {
    let (to_node1, from_node2) = mpsc::unbounded_channel();
    let (to_node2, from_node1) = mpsc::unbounded_channel();

    let peer1 = Peer::new(peer1_id, peer1_role, from_node1, to_node1);
    let peer2 = Peer::new(peer2_id, peer2_role, from_node2, to_node2);
    (peer1, peer2)
}
