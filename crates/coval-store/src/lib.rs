//! # Coval Store
//!
//! Storage adapter contract for coval, with a SQLite reference
//! implementation and an in-memory implementation for tests.
//!
//! ## Overview
//!
//! The node never talks to a database directly. It talks to a
//! [`StorageAdapter`], which exposes row-level reads plus a
//! [`transaction`](StorageAdapter::transaction) scope for writes, and it
//! moves whole content messages in and out through the [`persistence`]
//! helpers.
//!
//! ## Key Types
//!
//! - [`StorageAdapter`] - The async trait every backend implements
//! - [`StorageTxn`] - Reads and writes available inside a transaction
//! - [`SqliteStore`] - SQLite-based persistent storage
//! - [`MemoryStore`] - In-memory storage for tests
//! - [`StoreOutcome`] - Result of persisting a content message
//!
//! ## Usage
//!
//! ```rust,no_run
//! use coval_store::{persistence, SqliteStore};
//! use coval_core::CoValueId;
//!
//! async fn example(id: CoValueId) {
//!     // Open a SQLite database
//!     let store = SqliteStore::open("coval.db").unwrap();
//!
//!     // Everything stored for `id`, split at checkpoint signatures
//!     let content = persistence::load_content(&store, &id, None).await.unwrap();
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Atomic writes**: a failing transaction callback rolls back everything it wrote
//! - **Batching**: concurrent SQLite transactions share one SQL transaction,
//!   each isolated in its own savepoint
//! - **Corrupt rows**: logged and treated as unavailable
//! - **Checkpoints**: stored signatures split loaded content into
//!   independently verifiable chunks

pub mod error;
pub mod memory;
pub mod migration;
pub mod persistence;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use persistence::StoreOutcome;
pub use sqlite::SqliteStore;
pub use traits::{
    RowId, SessionRow, SessionUpdate, SignatureAfterRow, StorageAdapter, StorageAdapterExt,
    StorageTxn, StoredCoValueRow, TransactionRow, TxnFn,
};
