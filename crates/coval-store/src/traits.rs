//! Storage adapter trait: the abstract interface for CoValue persistence.
//!
//! This trait allows the node to be storage-agnostic. Implementations
//! include SQLite (reference) and in-memory (for tests).

use async_trait::async_trait;
use std::sync::{Arc, Mutex};

use coval_core::{CoValueHeader, CoValueId, Ed25519Signature, SessionId, Transaction};

use crate::error::{Result, StoreError};

/// Row id of a stored CoValue or session.
pub type RowId = i64;

/// A stored CoValue header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCoValueRow {
    pub row_id: RowId,
    pub id: CoValueId,
    pub header: CoValueHeader,
}

/// A stored session.
///
/// `last_idx` is the number of stored transactions, i.e. the index the next
/// transaction will take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRow {
    pub row_id: RowId,
    pub co_value: RowId,
    pub session_id: SessionId,
    pub last_idx: u32,
    pub last_signature: Ed25519Signature,
    pub bytes_since_last_signature: u64,
}

/// New values for a session row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionUpdate {
    pub co_value: RowId,
    pub session_id: SessionId,
    pub last_idx: u32,
    pub last_signature: Ed25519Signature,
    pub bytes_since_last_signature: u64,
}

/// A stored transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionRow {
    pub ses: RowId,
    pub idx: u32,
    pub tx: Transaction,
}

/// A stored checkpoint signature, covering transactions `0..=idx`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureAfterRow {
    pub ses: RowId,
    pub idx: u32,
    pub signature: Ed25519Signature,
}

/// Reads and writes available inside a storage transaction.
///
/// Everything done through one `StorageTxn` commits together or not at all.
pub trait StorageTxn {
    fn get_co_value(&self, id: &CoValueId) -> Result<Option<StoredCoValueRow>>;

    fn get_co_value_sessions(&self, co_value_row_id: RowId) -> Result<Vec<SessionRow>>;

    fn get_single_co_value_session(
        &self,
        co_value_row_id: RowId,
        session_id: &SessionId,
    ) -> Result<Option<SessionRow>>;

    /// Insert a header; returns the existing row id if it is already stored.
    fn add_co_value(&mut self, header: &CoValueHeader) -> Result<RowId>;

    /// Insert or update a session row.
    fn add_session_update(
        &mut self,
        update: &SessionUpdate,
        existing: Option<&SessionRow>,
    ) -> Result<RowId>;

    fn add_transaction(&mut self, session_row_id: RowId, idx: u32, tx: &Transaction) -> Result<()>;

    fn add_signature_after(
        &mut self,
        session_row_id: RowId,
        idx: u32,
        signature: &Ed25519Signature,
    ) -> Result<()>;
}

/// Callback run inside [`StorageAdapter::transaction`].
pub type TxnFn = Box<dyn FnOnce(&mut dyn StorageTxn) -> Result<()> + Send + 'static>;

/// The storage adapter: async interface for CoValue persistence.
///
/// # Design Notes
///
/// - **Atomic scopes**: writes happen inside [`StorageAdapter::transaction`];
///   if the callback returns an error, everything it wrote is rolled back
///   and the error is returned.
/// - **One writer**: only one transaction is active per connection at a time.
/// - **Corrupt rows**: rows that fail to parse are logged and treated as
///   absent, never surfaced as a panic.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────────────────────

    /// Get a stored CoValue by id.
    async fn get_co_value(&self, id: &CoValueId) -> Result<Option<StoredCoValueRow>>;

    /// All sessions of a stored CoValue.
    async fn get_co_value_sessions(&self, co_value_row_id: RowId) -> Result<Vec<SessionRow>>;

    /// One session of a stored CoValue.
    async fn get_single_co_value_session(
        &self,
        co_value_row_id: RowId,
        session_id: &SessionId,
    ) -> Result<Option<SessionRow>>;

    /// Transactions with `from_idx <= idx <= to_idx`, ordered by idx.
    async fn get_new_transactions_in_session(
        &self,
        session_row_id: RowId,
        from_idx: u32,
        to_idx: u32,
    ) -> Result<Vec<TransactionRow>>;

    /// Checkpoint signatures with `idx >= from_idx`, ordered by idx.
    async fn get_signatures(
        &self,
        session_row_id: RowId,
        from_idx: u32,
    ) -> Result<Vec<SignatureAfterRow>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Writes
    // ─────────────────────────────────────────────────────────────────────────

    /// Run `f` atomically.
    async fn transaction(&self, f: TxnFn) -> Result<()>;
}

/// Extension trait for common storage patterns.
pub trait StorageAdapterExt: StorageAdapter {
    /// Run `f` atomically and return its value.
    fn run<T, F>(&self, f: F) -> impl std::future::Future<Output = Result<T>> + Send
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn StorageTxn) -> Result<T> + Send + 'static;

    /// Insert a header in its own transaction.
    fn add_co_value(
        &self,
        header: &CoValueHeader,
    ) -> impl std::future::Future<Output = Result<RowId>> + Send;

    /// Insert or update a session row in its own transaction.
    fn add_session_update(
        &self,
        update: &SessionUpdate,
        existing: Option<&SessionRow>,
    ) -> impl std::future::Future<Output = Result<RowId>> + Send;

    /// Insert a transaction row in its own transaction.
    fn add_transaction(
        &self,
        session_row_id: RowId,
        idx: u32,
        tx: &Transaction,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Insert a checkpoint signature in its own transaction.
    fn add_signature_after(
        &self,
        session_row_id: RowId,
        idx: u32,
        signature: &Ed25519Signature,
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

impl<S: StorageAdapter + ?Sized> StorageAdapterExt for S {
    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn StorageTxn) -> Result<T> + Send + 'static,
    {
        let slot = Arc::new(Mutex::new(None));
        let out = slot.clone();
        self.transaction(Box::new(move |txn| {
            let value = f(txn)?;
            if let Ok(mut out) = out.lock() {
                *out = Some(value);
            }
            Ok(())
        }))
        .await?;

        let value = slot
            .lock()
            .map_err(|e| StoreError::TaskFailed(format!("result slot poisoned: {e}")))?
            .take();
        value.ok_or_else(|| StoreError::TaskFailed("transaction produced no result".into()))
    }

    async fn add_co_value(&self, header: &CoValueHeader) -> Result<RowId> {
        let header = header.clone();
        self.run(move |txn| txn.add_co_value(&header)).await
    }

    async fn add_session_update(
        &self,
        update: &SessionUpdate,
        existing: Option<&SessionRow>,
    ) -> Result<RowId> {
        let update = update.clone();
        let existing = existing.cloned();
        self.run(move |txn| txn.add_session_update(&update, existing.as_ref()))
            .await
    }

    async fn add_transaction(&self, session_row_id: RowId, idx: u32, tx: &Transaction) -> Result<()> {
        let tx = tx.clone();
        self.run(move |txn| txn.add_transaction(session_row_id, idx, &tx))
            .await
    }

    async fn add_signature_after(
        &self,
        session_row_id: RowId,
        idx: u32,
        signature: &Ed25519Signature,
    ) -> Result<()> {
        let signature = *signature;
        self.run(move |txn| txn.add_signature_after(session_row_id, idx, &signature))
            .await
    }
}
