//! # Coval Sync
//!
//! Building blocks for syncing CoValues between peers.
//!
//! ## Overview
//!
//! Peers exchange three kinds of message per CoValue: `load` (what I have,
//! send me the rest), `known` (what I have) and `content` (new header and
//! transactions). Every message is idempotent: content a peer already has
//! is trimmed, and known states only ever combine upward unless explicitly
//! corrected.
//!
//! ## Key Types
//!
//! - [`SyncMessage`] - Wire messages, JSON tagged by `action`
//! - [`Peer`] / [`connected_peers`] - Peer connections over tokio channels
//! - [`PeerState`] - Confirmed and optimistic known states per peer
//! - [`IncomingMessagesQueue`] - Round-robin inbound queue
//! - [`LocalTransactionsSyncQueue`] - Order-preserving batching of local writes
//! - [`spawn_storage_peer`] - A storage adapter served as a peer
//!
//! ## Message Flow
//!
//! ```text
//! Node A                              Node B
//!   |-------- load {id, sessions} ---->|
//!   |<------- content (dependencies) --|
//!   |<------- content {id, new} -------|
//!   |-------- known {id, sessions} --->|
//!   |          ... local write ...     |
//!   |-------- content {id, new} ------>|
//!   |<------- known {id, sessions} ----|
//! ```

pub mod config;
pub mod error;
pub mod incoming_queue;
pub mod local_sync_queue;
pub mod messages;
pub mod peer;
pub mod storage_peer;
pub mod transport;

pub use config::SyncConfig;
pub use error::{Result, SyncError};
pub use incoming_queue::{IncomingMessagesQueue, ProcessingBudget};
pub use local_sync_queue::{DirtyTracker, LocalTransactionsSyncQueue};
pub use messages::{KnownMessage, SyncMessage};
pub use peer::PeerState;
pub use storage_peer::{spawn_storage_peer, StoragePeer};
pub use transport::{connected_peers, Peer, PeerId, PeerRole};
