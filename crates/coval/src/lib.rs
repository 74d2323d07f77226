//! # Coval
//!
//! A local-first sync engine for CoValues: collaborative values built from
//! signed, append-only session logs, replicated between peers and durable
//! storage.
//!
//! ## Overview
//!
//! A [`LocalNode`] holds CoValues for one agent and provides:
//!
//! - **Writing**: transactions appended to this node's own session, signed
//!   and optionally encrypted with the owner group's read key
//! - **Sync**: exchange of known states and content with any number of
//!   peers, dependencies first
//! - **Storage**: a [`StorageAdapter`](store::StorageAdapter) served as a
//!   peer, written through on every change
//! - **Permissions**: groups with roles and sealed read keys deciding which
//!   transactions are valid and who can read them
//! - **Branching**: cheap forks of a CoValue that can be merged back,
//!   idempotently and incrementally
//!
//! ## Key Concepts
//!
//! - **Session**: One writer's ordered log for one CoValue. Only its owner
//!   appends to it; everyone else verifies its signatures.
//! - **Known state**: Per-session transaction counts. Peers exchange them to
//!   find out what the other side is missing.
//! - **Valid transactions**: Transactions whose author was allowed to write
//!   them at the time, decrypted and in replay order.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use coval::core::AgentSecret;
//! use coval::store::SqliteStore;
//! use coval::sync::{connected_peers, PeerRole};
//! use coval::{LocalNode, NodeConfig};
//! use serde_json::json;
//!
//! async fn example() -> coval::Result<()> {
//!     let client = LocalNode::new(AgentSecret::generate(), NodeConfig::default());
//!     let server = LocalNode::new(AgentSecret::generate(), NodeConfig::default());
//!
//!     // Durable storage for the server
//!     server.add_storage(Arc::new(SqliteStore::open("coval.db")?));
//!
//!     // Link the two nodes
//!     let (server_peer, client_peer) =
//!         connected_peers("server", "client", PeerRole::Server, PeerRole::Client);
//!     client.add_peer(server_peer);
//!     server.add_peer(client_peer);
//!
//!     // Write on the client, wait for the server to confirm
//!     let group = client.create_group()?;
//!     let map = client.create_map(group)?;
//!     map.set("title", json!("hello"))?;
//!     client.wait_for_sync(map.id(), &"server".into()).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Re-exports
//!
//! This crate re-exports the component crates for convenience:
//!
//! - `coval::core` - Identifiers, headers, transactions, session logs
//! - `coval::perms` - Roles, groups, key sealing
//! - `coval::store` - Storage adapters (SQLite, in-memory)
//! - `coval::sync` - Wire messages, peers, queues

pub mod branching;
pub mod co_value_core;
pub mod comap;
pub mod config;
pub mod error;
pub mod groups;
pub mod node;
pub mod refs;
pub mod subscription;

mod state;
mod sync_manager;

// Re-export component crates
pub use coval_core as core;
pub use coval_perms as perms;
pub use coval_store as store;
pub use coval_sync as sync;

// Re-export main types for convenience
pub use branching::MergeCommit;
pub use co_value_core::{CoValueCore, LoadOutcome};
pub use comap::RawCoMap;
pub use config::NodeConfig;
pub use error::{NodeError, Result};
pub use node::LocalNode;
pub use refs::{CoValueContent, CoValueRef};
pub use state::ValidTransactionsOptions;
pub use subscription::Subscription;

// Re-export commonly used core types
pub use coval_core::{
    AgentId, AgentSecret, CoValueHeader, CoValueId, CoValueType, DecryptedTransaction,
    KnownState, PrivacyKind, Ruleset, SessionId, TransactionMeta,
};
pub use coval_perms::Role;
