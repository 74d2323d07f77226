//! Test fixtures and helpers.
//!
//! Common setup code for integration tests: agents, nodes, and nodes wired
//! to each other over in-memory channels.

use std::ops::Deref;
use std::sync::{Arc, Once};
use std::time::Duration;

use serde_json::Value;

use coval::{LocalNode, NodeConfig};
use coval_core::{
    AgentId, AgentSecret, CoValueId, CoreError, NewContentMessage, Privacy, SessionCounts,
    SessionId, SessionLog, SessionNewContent, DEFAULT_CHECKPOINT_BYTES,
};
use coval_store::MemoryStore;
use coval_sync::{connected_peers, Peer, PeerId, PeerRole, SyncMessage};

/// How long helpers wait for a message before giving up.
pub const MESSAGE_TIMEOUT: Duration = Duration::from_secs(5);

/// Install a fmt subscriber that writes through the test harness.
///
/// Safe to call from every test; only the first call installs it.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    });
}

/// An agent with its secret, for tests that need to recreate a node.
#[derive(Clone)]
pub struct TestAgent {
    pub secret: AgentSecret,
}

impl TestAgent {
    /// Create a new agent with random keys.
    pub fn new() -> Self {
        Self {
            secret: AgentSecret::generate(),
        }
    }

    /// Create with deterministic keys from a one-byte seed.
    pub fn with_seed(seed: u8) -> Self {
        Self {
            secret: AgentSecret::from_seed(&[seed; 32]),
        }
    }

    pub fn id(&self) -> AgentId {
        self.secret.agent_id()
    }
}

impl Default for TestAgent {
    fn default() -> Self {
        Self::new()
    }
}

/// A named node. Derefs to [`LocalNode`].
pub struct TestNode {
    pub name: String,
    pub agent: TestAgent,
    pub node: LocalNode,
}

impl TestNode {
    /// A node for a fresh random agent.
    pub fn new(name: &str) -> Self {
        Self::with_agent(name, TestAgent::new())
    }

    /// A node for `agent`. Each call gets a new session.
    pub fn with_agent(name: &str, agent: TestAgent) -> Self {
        let node = LocalNode::new(agent.secret.clone(), NodeConfig::default());
        Self {
            name: name.to_string(),
            agent,
            node,
        }
    }

    /// The id other nodes know this node by.
    pub fn peer_id(&self) -> PeerId {
        PeerId::new(self.name.clone())
    }

    /// Make `server` an upstream server of this node.
    pub fn connect_to_server(&self, server: &TestNode) {
        let (server_peer, client_peer) = connected_peers(
            server.name.clone(),
            self.name.clone(),
            PeerRole::Server,
            PeerRole::Client,
        );
        self.node.add_peer(server_peer);
        server.node.add_peer(client_peer);
    }

    /// Attach a fresh in-memory store as this node's storage peer.
    pub fn with_memory_storage(self) -> (Self, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        self.node.add_storage(store.clone());
        (self, store)
    }
}

impl Deref for TestNode {
    type Target = LocalNode;

    fn deref(&self) -> &LocalNode {
        &self.node
    }
}

/// A client connected to a server: `(client, server)`.
pub fn connected_nodes() -> (TestNode, TestNode) {
    let client = TestNode::new("client");
    let server = TestNode::new("server");
    client.connect_to_server(&server);
    (client, server)
}

/// A server with one connected client per name.
pub fn server_with_clients(names: &[&str]) -> (TestNode, Vec<TestNode>) {
    let server = TestNode::new("server");
    let clients = names
        .iter()
        .map(|name| {
            let client = TestNode::new(name);
            client.connect_to_server(&server);
            client
        })
        .collect();
    (server, clients)
}

/// Attach a hand-driven peer to `node` under `name` with `role`.
///
/// Returns the far end: its `incoming` yields what the node sends, its
/// `outgoing` delivers messages to the node.
pub fn raw_peer(node: &LocalNode, name: &str, role: PeerRole) -> Peer {
    let (for_node, far_end) = connected_peers(name, "node", role, PeerRole::Client);
    node.add_peer(for_node);
    far_end
}

/// One hand-written trusting transaction: `(made_at, group position, change)`.
pub type HandWrite<'a> = (u64, Option<&'a SessionCounts>, Value);

/// Signed content for `id` in a fresh session of `agent`, one trusting
/// transaction per write. Lets a test speak for an agent the way a
/// misbehaving client would, bypassing the node's own checks.
pub fn session_content(
    id: CoValueId,
    agent: &AgentSecret,
    writes: &[HandWrite<'_>],
) -> Result<(SessionId, NewContentMessage), CoreError> {
    let session = SessionId::new_random(agent.agent_id());
    let mut log = SessionLog::new(session, DEFAULT_CHECKPOINT_BYTES);
    let mut msg = NewContentMessage::empty(id);
    for (made_at, group_at, change) in writes {
        log.add_new_transaction_at(
            std::slice::from_ref(change),
            None,
            Privacy::Trusting,
            *group_at,
            &agent.signer,
            *made_at,
        )?;
    }
    if let Some(last_signature) = log.last_signature() {
        msg.new.insert(
            session,
            SessionNewContent {
                after: 0,
                new_transactions: log.transactions().to_vec(),
                last_signature,
            },
        );
    }
    Ok((session, msg))
}

/// Next message from `peer`, or `None` after [`MESSAGE_TIMEOUT`].
pub async fn next_message(peer: &mut Peer) -> Option<SyncMessage> {
    tokio::time::timeout(MESSAGE_TIMEOUT, peer.incoming.recv())
        .await
        .ok()
        .flatten()
}

/// Every message already waiting on `peer`.
pub fn drain_messages(peer: &mut Peer) -> Vec<SyncMessage> {
    let mut messages = Vec::new();
    while let Ok(msg) = peer.incoming.try_recv() {
        messages.push(msg);
    }
    messages
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_content_verifies() {
        let agent = AgentSecret::generate();
        let id = CoValueId::from_bytes([9; 32]);
        let writes = [(1, None, serde_json::json!({"op": "set", "key": "k", "value": 1}))];
        let (session, msg) = session_content(id, &agent, &writes).unwrap();

        let content = &msg.new[&session];
        let mut log = SessionLog::new(session, DEFAULT_CHECKPOINT_BYTES);
        log.try_add(content.new_transactions.clone(), content.last_signature, false)
            .unwrap();
        assert_eq!(log.tx_count(), 1);
    }

    #[test]
    fn seeded_agents_are_stable() {
        assert_eq!(TestAgent::with_seed(1).id(), TestAgent::with_seed(1).id());
        assert_ne!(TestAgent::with_seed(1).id(), TestAgent::with_seed(2).id());
    }

    #[tokio::test]
    async fn same_agent_gets_a_new_session() {
        let agent = TestAgent::with_seed(3);
        let a = TestNode::with_agent("a", agent.clone());
        let b = TestNode::with_agent("b", agent.clone());

        assert_eq!(a.agent_id(), b.agent_id());
        assert_ne!(a.session_id(), b.session_id());
    }

    #[tokio::test]
    async fn raw_peer_sees_local_writes() {
        let node = TestNode::new("node");
        let mut server = raw_peer(&node, "server", PeerRole::Server);

        let group = node.create_group().unwrap();
        node.flush();

        let messages = drain_messages(&mut server);
        assert!(messages
            .iter()
            .any(|msg| matches!(msg, SyncMessage::Content(c) if c.id == group)));
    }
}
