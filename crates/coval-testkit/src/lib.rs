//! # Coval Testkit
//!
//! Testing utilities for coval.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: Agents, named nodes, and nodes wired to a server over
//!   in-memory channels
//! - **Generators**: Proptest strategies for map ops and signed transaction
//!   batches
//!
//! ## Test Fixtures
//!
//! Quickly set up a client and a server:
//!
//! ```rust,no_run
//! use coval_testkit::fixtures::connected_nodes;
//!
//! # async fn example() {
//! let (client, server) = connected_nodes();
//! let group = client.create_group().unwrap();
//! client.wait_for_sync(group, &server.peer_id()).await.unwrap();
//! # }
//! ```
//!
//! ## Property Testing
//!
//! Use the generators with proptest:
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use coval_testkit::generators::{apply_map_ops, map_ops};
//!
//! proptest! {
//!     #[test]
//!     fn map_matches_model(ops in map_ops(16)) {
//!         let expected = apply_map_ops(&ops);
//!         // write `ops` through a RawCoMap and compare
//!     }
//! }
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{
    connected_nodes, drain_messages, init_tracing, next_message, raw_peer, server_with_clients,
    session_content, HandWrite, TestAgent, TestNode,
};
pub use generators::{apply_map_ops, change_batches, map_ops, MapOp, TransactionBatches};
