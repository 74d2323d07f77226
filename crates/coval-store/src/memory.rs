//! In-memory implementation of the storage adapter.
//!
//! This is primarily for testing. It has the same semantics as SQLite
//! but keeps everything in memory with no persistence.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard};

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;

use coval_core::{CoValueHeader, CoValueId, Ed25519Signature, SessionId, Transaction};

use crate::error::{Result, StoreError};
use crate::traits::{
    RowId, SessionRow, SessionUpdate, SignatureAfterRow, StorageAdapter, StorageTxn,
    StoredCoValueRow, TransactionRow, TxnFn,
};

/// In-memory storage adapter.
///
/// All data is lost when the adapter is dropped. Thread-safe via RwLock.
/// Transactions run against a copy of the data that replaces the original
/// only when the callback succeeds.
pub struct MemoryStore {
    inner: RwLock<MemoryData>,

    /// Held for the duration of a transaction.
    active: AsyncMutex<()>,
}

#[derive(Clone, Default)]
struct MemoryData {
    next_row_id: RowId,

    co_values: HashMap<CoValueId, StoredCoValueRow>,

    /// Session rows keyed by (co_value row, session).
    sessions: BTreeMap<(RowId, SessionId), SessionRow>,

    /// Transactions keyed by (session row, idx).
    transactions: BTreeMap<(RowId, u32), Transaction>,

    /// Checkpoint signatures keyed by (session row, idx).
    signatures: BTreeMap<(RowId, u32), Ed25519Signature>,
}

impl MemoryData {
    fn next_row_id(&mut self) -> RowId {
        self.next_row_id += 1;
        self.next_row_id
    }
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryData::default()),
            active: AsyncMutex::new(()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryData>> {
        self.inner
            .read()
            .map_err(|e| StoreError::TaskFailed(format!("lock poisoned: {e}")))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageTxn for MemoryData {
    fn get_co_value(&self, id: &CoValueId) -> Result<Option<StoredCoValueRow>> {
        Ok(self.co_values.get(id).cloned())
    }

    fn get_co_value_sessions(&self, co_value_row_id: RowId) -> Result<Vec<SessionRow>> {
        Ok(self
            .sessions
            .iter()
            .filter(|((co_value, _), _)| *co_value == co_value_row_id)
            .map(|(_, row)| row.clone())
            .collect())
    }

    fn get_single_co_value_session(
        &self,
        co_value_row_id: RowId,
        session_id: &SessionId,
    ) -> Result<Option<SessionRow>> {
        Ok(self.sessions.get(&(co_value_row_id, *session_id)).cloned())
    }

    fn add_co_value(&mut self, header: &CoValueHeader) -> Result<RowId> {
        let id = header.id();
        if let Some(existing) = self.co_values.get(&id) {
            return Ok(existing.row_id);
        }
        let row_id = self.next_row_id();
        self.co_values.insert(
            id,
            StoredCoValueRow {
                row_id,
                id,
                header: header.clone(),
            },
        );
        Ok(row_id)
    }

    fn add_session_update(
        &mut self,
        update: &SessionUpdate,
        existing: Option<&SessionRow>,
    ) -> Result<RowId> {
        let key = (update.co_value, update.session_id);
        let known = existing
            .map(|e| e.row_id)
            .or_else(|| self.sessions.get(&key).map(|e| e.row_id));
        let row_id = match known {
            Some(row_id) => row_id,
            None => self.next_row_id(),
        };
        self.sessions.insert(
            key,
            SessionRow {
                row_id,
                co_value: update.co_value,
                session_id: update.session_id,
                last_idx: update.last_idx,
                last_signature: update.last_signature,
                bytes_since_last_signature: update.bytes_since_last_signature,
            },
        );
        Ok(row_id)
    }

    fn add_transaction(&mut self, session_row_id: RowId, idx: u32, tx: &Transaction) -> Result<()> {
        self.transactions
            .entry((session_row_id, idx))
            .or_insert_with(|| tx.clone());
        Ok(())
    }

    fn add_signature_after(
        &mut self,
        session_row_id: RowId,
        idx: u32,
        signature: &Ed25519Signature,
    ) -> Result<()> {
        self.signatures.insert((session_row_id, idx), *signature);
        Ok(())
    }
}

#[async_trait]
impl StorageAdapter for MemoryStore {
    async fn get_co_value(&self, id: &CoValueId) -> Result<Option<StoredCoValueRow>> {
        self.read()?.get_co_value(id)
    }

    async fn get_co_value_sessions(&self, co_value_row_id: RowId) -> Result<Vec<SessionRow>> {
        self.read()?.get_co_value_sessions(co_value_row_id)
    }

    async fn get_single_co_value_session(
        &self,
        co_value_row_id: RowId,
        session_id: &SessionId,
    ) -> Result<Option<SessionRow>> {
        self.read()?
            .get_single_co_value_session(co_value_row_id, session_id)
    }

    async fn get_new_transactions_in_session(
        &self,
        session_row_id: RowId,
        from_idx: u32,
        to_idx: u32,
    ) -> Result<Vec<TransactionRow>> {
        if from_idx > to_idx {
            return Ok(Vec::new());
        }
        Ok(self
            .read()?
            .transactions
            .range((session_row_id, from_idx)..=(session_row_id, to_idx))
            .map(|(&(ses, idx), tx)| TransactionRow {
                ses,
                idx,
                tx: tx.clone(),
            })
            .collect())
    }

    async fn get_signatures(
        &self,
        session_row_id: RowId,
        from_idx: u32,
    ) -> Result<Vec<SignatureAfterRow>> {
        Ok(self
            .read()?
            .signatures
            .range((session_row_id, from_idx)..=(session_row_id, u32::MAX))
            .map(|(&(ses, idx), signature)| SignatureAfterRow {
                ses,
                idx,
                signature: *signature,
            })
            .collect())
    }

    async fn transaction(&self, f: TxnFn) -> Result<()> {
        let _active = self.active.lock().await;

        let mut scratch = self.read()?.clone();
        f(&mut scratch)?;

        let mut inner = self
            .inner
            .write()
            .map_err(|e| StoreError::TaskFailed(format!("lock poisoned: {e}")))?;
        *inner = scratch;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::StorageAdapterExt;
    use coval_core::{AgentSecret, CoValueType, Keypair, Ruleset};
    use serde_json::json;

    fn header() -> CoValueHeader {
        CoValueHeader::new_unique(CoValueType::CoList, Ruleset::UnsafeAllowAll)
    }

    #[tokio::test]
    async fn test_add_co_value_idempotent() {
        let store = MemoryStore::new();
        let header = header();
        let a = store.add_co_value(&header).await.unwrap();
        let b = store.add_co_value(&header).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(store.get_co_value(&header.id()).await.unwrap().unwrap().header, header);
    }

    #[tokio::test]
    async fn test_transaction_range() {
        let store = MemoryStore::new();
        let co_value = store.add_co_value(&header()).await.unwrap();
        let session_id = SessionId::new_random(AgentSecret::generate().agent_id());
        let ses = store
            .add_session_update(
                &SessionUpdate {
                    co_value,
                    session_id,
                    last_idx: 5,
                    last_signature: Keypair::generate().sign(b"s"),
                    bytes_since_last_signature: 0,
                },
                None,
            )
            .await
            .unwrap();

        for i in 0..5u32 {
            let tx = Transaction::Trusting {
                changes: json!([{"op": "app", "value": i}]),
                made_at: i as u64,
                meta: None,
                group_at: None,
            };
            store.add_transaction(ses, i, &tx).await.unwrap();
        }

        let rows = store.get_new_transactions_in_session(ses, 2, 3).await.unwrap();
        assert_eq!(rows.iter().map(|r| r.idx).collect::<Vec<_>>(), vec![2, 3]);
        assert!(store
            .get_new_transactions_in_session(ses, 3, 2)
            .await
            .unwrap()
            .is_empty());
        assert!(store.get_signatures(ses, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_transaction_leaves_no_trace() {
        let store = MemoryStore::new();
        let header = header();
        let planted = header.clone();

        let result = store
            .transaction(Box::new(move |txn| {
                txn.add_co_value(&planted)?;
                Err(StoreError::Aborted("rollback".into()))
            }))
            .await;

        assert!(result.is_err());
        assert!(store.get_co_value(&header.id()).await.unwrap().is_none());
    }
}
