//! SQLite implementation of the storage adapter.
//!
//! This is the reference storage backend for coval. It uses rusqlite with
//! bundled SQLite, wrapped in async via tokio::spawn_blocking.
//!
//! Headers and transactions are stored as JSON text. Rows that no longer
//! parse are logged and treated as absent.
//!
//! Transactions are queued and drained by whichever blocking task takes the
//! connection first: everything queued at that moment runs inside one SQL
//! transaction, each callback in its own savepoint, so a failing callback
//! only rolls back its own writes.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use coval_core::{CoValueHeader, CoValueId, Ed25519Signature, SessionId, Transaction};

use crate::error::{Result, StoreError};
use crate::migration;
use crate::traits::{
    RowId, SessionRow, SessionUpdate, SignatureAfterRow, StorageAdapter, StorageTxn,
    StoredCoValueRow, TransactionRow, TxnFn,
};

/// A transaction waiting for the connection.
struct PendingTxn {
    f: TxnFn,
    done: oneshot::Sender<Result<()>>,
}

/// SQLite-based storage adapter.
///
/// Thread-safe via internal Mutex; holding the connection mutex is holding
/// the active transaction. All operations use spawn_blocking to avoid
/// blocking the async runtime.
pub struct SqliteStore {
    /// The SQLite connection, protected by a mutex.
    conn: Arc<Mutex<Connection>>,

    /// Transactions not yet picked up by a drain.
    pending: Arc<Mutex<Vec<PendingTxn>>>,
}

impl SqliteStore {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        Ok(Self::from_connection(conn))
    }

    /// Open an in-memory SQLite database.
    ///
    /// Useful for testing.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            pending: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Run a blocking read on the connection.
    async fn read<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::TaskFailed(format!("spawn_blocking failed: {e}")))?
    }

    /// Raw access for tests that need to plant bad rows.
    #[cfg(test)]
    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> T) -> T {
        let conn = self.conn.lock().unwrap();
        f(&conn)
    }
}

fn lock<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    m.lock()
        .map_err(|e| StoreError::TaskFailed(format!("mutex poisoned: {e}")))
}

/// Run every queued transaction inside one SQL transaction.
fn drain(conn: &Mutex<Connection>, pending: &Mutex<Vec<PendingTxn>>) -> Result<()> {
    let mut conn = lock(conn)?;
    let batch = std::mem::take(&mut *lock(pending)?);
    if batch.is_empty() {
        // Another drain already ran ours.
        return Ok(());
    }
    debug!(count = batch.len(), "draining storage transactions");

    let mut tx = conn.transaction()?;
    let mut results = Vec::with_capacity(batch.len());
    for PendingTxn { f, done } in batch {
        let result = match tx.savepoint() {
            Ok(sp) => {
                let result = f(&mut SqliteTxn { conn: &sp });
                match result {
                    Ok(()) => sp.commit().map_err(StoreError::from),
                    // Dropping the savepoint rolls it back.
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(StoreError::from(e)),
        };
        results.push((done, result));
    }

    match tx.commit() {
        Ok(()) => {
            for (done, result) in results {
                let _ = done.send(result);
            }
        }
        Err(e) => {
            warn!(error = %e, "storage commit failed");
            for (done, _) in results {
                let _ = done.send(Err(StoreError::CommitFailed(e.to_string())));
            }
        }
    }
    Ok(())
}

/// A [`StorageTxn`] over a connection inside an open savepoint.
struct SqliteTxn<'c> {
    conn: &'c Connection,
}

fn row_to_co_value(row: &rusqlite::Row<'_>) -> rusqlite::Result<(RowId, String, String)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
}

fn parse_co_value((row_id, id, header): (RowId, String, String)) -> Option<StoredCoValueRow> {
    let header: CoValueHeader = match serde_json::from_str(&header) {
        Ok(header) => header,
        Err(e) => {
            warn!(%id, error = %e, "unparseable header in storage, treating as unavailable");
            return None;
        }
    };
    let id = match id.parse::<CoValueId>() {
        Ok(id) => id,
        Err(e) => {
            warn!(%id, error = %e, "unparseable CoValue id in storage");
            return None;
        }
    };
    Some(StoredCoValueRow { row_id, id, header })
}

type RawSessionRow = (RowId, RowId, String, Option<u32>, Option<String>, Option<u64>);

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawSessionRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn parse_session(
    (row_id, co_value, session_id, last_idx, last_signature, bytes): RawSessionRow,
) -> Option<SessionRow> {
    let parsed = session_id.parse::<SessionId>().ok().zip(
        last_signature
            .as_deref()
            .and_then(|s| s.parse::<Ed25519Signature>().ok()),
    );
    match parsed {
        Some((session_id, last_signature)) => Some(SessionRow {
            row_id,
            co_value,
            session_id,
            last_idx: last_idx.unwrap_or(0),
            last_signature,
            bytes_since_last_signature: bytes.unwrap_or(0),
        }),
        None => {
            warn!(row_id, %session_id, "corrupt session row in storage, skipping");
            None
        }
    }
}

fn select_co_value(conn: &Connection, id: &CoValueId) -> Result<Option<StoredCoValueRow>> {
    let raw = conn
        .query_row(
            "SELECT rowID, id, header FROM coValues WHERE id = ?1",
            params![id.to_string()],
            row_to_co_value,
        )
        .optional()?;
    Ok(raw.and_then(parse_co_value))
}

fn select_sessions(conn: &Connection, co_value_row_id: RowId) -> Result<Vec<SessionRow>> {
    let mut stmt = conn.prepare(
        "SELECT rowID, coValue, sessionID, lastIdx, lastSignature, bytesSinceLastSignature
         FROM sessions WHERE coValue = ?1 ORDER BY sessionID",
    )?;
    let rows = stmt
        .query_map(params![co_value_row_id], row_to_session)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows.into_iter().filter_map(parse_session).collect())
}

fn select_session(
    conn: &Connection,
    co_value_row_id: RowId,
    session_id: &SessionId,
) -> Result<Option<SessionRow>> {
    let raw = conn
        .query_row(
            "SELECT rowID, coValue, sessionID, lastIdx, lastSignature, bytesSinceLastSignature
             FROM sessions WHERE coValue = ?1 AND sessionID = ?2",
            params![co_value_row_id, session_id.to_string()],
            row_to_session,
        )
        .optional()?;
    Ok(raw.and_then(parse_session))
}

impl StorageTxn for SqliteTxn<'_> {
    fn get_co_value(&self, id: &CoValueId) -> Result<Option<StoredCoValueRow>> {
        select_co_value(self.conn, id)
    }

    fn get_co_value_sessions(&self, co_value_row_id: RowId) -> Result<Vec<SessionRow>> {
        select_sessions(self.conn, co_value_row_id)
    }

    fn get_single_co_value_session(
        &self,
        co_value_row_id: RowId,
        session_id: &SessionId,
    ) -> Result<Option<SessionRow>> {
        select_session(self.conn, co_value_row_id, session_id)
    }

    fn add_co_value(&mut self, header: &CoValueHeader) -> Result<RowId> {
        let id = header.id().to_string();
        let header_json =
            serde_json::to_string(header).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.conn.execute(
            "INSERT INTO coValues (id, header) VALUES (?1, ?2) ON CONFLICT(id) DO NOTHING",
            params![id, header_json],
        )?;
        let row_id = self.conn.query_row(
            "SELECT rowID FROM coValues WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(row_id)
    }

    fn add_session_update(
        &mut self,
        update: &SessionUpdate,
        existing: Option<&SessionRow>,
    ) -> Result<RowId> {
        let signature = update.last_signature.to_string();
        if let Some(existing) = existing {
            self.conn.execute(
                "UPDATE sessions SET lastIdx = ?1, lastSignature = ?2, bytesSinceLastSignature = ?3
                 WHERE rowID = ?4",
                params![
                    update.last_idx,
                    signature,
                    update.bytes_since_last_signature,
                    existing.row_id
                ],
            )?;
            return Ok(existing.row_id);
        }

        let row_id = self.conn.query_row(
            "INSERT INTO sessions (coValue, sessionID, lastIdx, lastSignature, bytesSinceLastSignature)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(coValue, sessionID) DO UPDATE SET
                lastIdx = excluded.lastIdx,
                lastSignature = excluded.lastSignature,
                bytesSinceLastSignature = excluded.bytesSinceLastSignature
             RETURNING rowID",
            params![
                update.co_value,
                update.session_id.to_string(),
                update.last_idx,
                signature,
                update.bytes_since_last_signature
            ],
            |row| row.get(0),
        )?;
        Ok(row_id)
    }

    fn add_transaction(&mut self, session_row_id: RowId, idx: u32, tx: &Transaction) -> Result<()> {
        let tx_json =
            serde_json::to_string(tx).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.conn.execute(
            "INSERT INTO transactions (ses, idx, tx) VALUES (?1, ?2, ?3)
             ON CONFLICT(ses, idx) DO NOTHING",
            params![session_row_id, idx, tx_json],
        )?;
        Ok(())
    }

    fn add_signature_after(
        &mut self,
        session_row_id: RowId,
        idx: u32,
        signature: &Ed25519Signature,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO signatureAfter (ses, idx, signature) VALUES (?1, ?2, ?3)
             ON CONFLICT(ses, idx) DO UPDATE SET signature = excluded.signature",
            params![session_row_id, idx, signature.to_string()],
        )?;
        Ok(())
    }
}

#[async_trait]
impl StorageAdapter for SqliteStore {
    async fn get_co_value(&self, id: &CoValueId) -> Result<Option<StoredCoValueRow>> {
        let id = *id;
        self.read(move |conn| select_co_value(conn, &id)).await
    }

    async fn get_co_value_sessions(&self, co_value_row_id: RowId) -> Result<Vec<SessionRow>> {
        self.read(move |conn| select_sessions(conn, co_value_row_id))
            .await
    }

    async fn get_single_co_value_session(
        &self,
        co_value_row_id: RowId,
        session_id: &SessionId,
    ) -> Result<Option<SessionRow>> {
        let session_id = *session_id;
        self.read(move |conn| select_session(conn, co_value_row_id, &session_id))
            .await
    }

    async fn get_new_transactions_in_session(
        &self,
        session_row_id: RowId,
        from_idx: u32,
        to_idx: u32,
    ) -> Result<Vec<TransactionRow>> {
        self.read(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT ses, idx, tx FROM transactions
                 WHERE ses = ?1 AND idx >= ?2 AND idx <= ?3 ORDER BY idx",
            )?;
            let rows = stmt
                .query_map(params![session_row_id, from_idx, to_idx], |row| {
                    Ok((
                        row.get::<_, RowId>(0)?,
                        row.get::<_, u32>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            Ok(rows
                .into_iter()
                .filter_map(|(ses, idx, tx)| match serde_json::from_str(&tx) {
                    Ok(tx) => Some(TransactionRow { ses, idx, tx }),
                    Err(e) => {
                        warn!(ses, idx, error = %e, "unparseable transaction in storage, skipping");
                        None
                    }
                })
                .collect())
        })
        .await
    }

    async fn get_signatures(
        &self,
        session_row_id: RowId,
        from_idx: u32,
    ) -> Result<Vec<SignatureAfterRow>> {
        self.read(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT ses, idx, signature FROM signatureAfter
                 WHERE ses = ?1 AND idx >= ?2 ORDER BY idx",
            )?;
            let rows = stmt
                .query_map(params![session_row_id, from_idx], |row| {
                    Ok((
                        row.get::<_, RowId>(0)?,
                        row.get::<_, u32>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            Ok(rows
                .into_iter()
                .filter_map(|(ses, idx, signature)| match signature.parse() {
                    Ok(signature) => Some(SignatureAfterRow { ses, idx, signature }),
                    Err(e) => {
                        warn!(ses, idx, error = %e, "unparseable signature in storage, skipping");
                        None
                    }
                })
                .collect())
        })
        .await
    }

    async fn transaction(&self, f: TxnFn) -> Result<()> {
        let (done, result) = oneshot::channel();
        lock(&self.pending)?.push(PendingTxn { f, done });

        let conn = self.conn.clone();
        let pending = self.pending.clone();
        tokio::task::spawn_blocking(move || drain(&conn, &pending))
            .await
            .map_err(|e| StoreError::TaskFailed(format!("spawn_blocking failed: {e}")))??;

        result
            .await
            .map_err(|_| StoreError::TaskFailed("storage transaction was dropped".into()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::StorageAdapterExt;
    use coval_core::{AgentSecret, CoValueType, Keypair, Ruleset};
    use serde_json::json;

    fn header() -> CoValueHeader {
        CoValueHeader::new_unique(CoValueType::CoMap, Ruleset::UnsafeAllowAll)
    }

    fn tx(n: u64) -> Transaction {
        Transaction::Trusting {
            changes: json!([{"op": "set", "key": "n", "value": n}]),
            made_at: n,
            meta: None,
            group_at: None,
        }
    }

    fn session() -> SessionId {
        SessionId::new_random(AgentSecret::generate().agent_id())
    }

    fn sig() -> Ed25519Signature {
        Keypair::generate().sign(b"x")
    }

    #[tokio::test]
    async fn test_add_and_get_co_value() {
        let store = SqliteStore::open_memory().unwrap();
        let header = header();

        let row_id = store.add_co_value(&header).await.unwrap();
        // Same header again returns the same row.
        assert_eq!(store.add_co_value(&header).await.unwrap(), row_id);

        let stored = store.get_co_value(&header.id()).await.unwrap().unwrap();
        assert_eq!(stored.row_id, row_id);
        assert_eq!(stored.header, header);

        assert!(store.get_co_value(&CoValueId::from_bytes([9; 32])).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sessions_and_transactions() {
        let store = SqliteStore::open_memory().unwrap();
        let co_value = store.add_co_value(&header()).await.unwrap();
        let session_id = session();
        let signature = sig();

        let update = SessionUpdate {
            co_value,
            session_id,
            last_idx: 3,
            last_signature: signature,
            bytes_since_last_signature: 120,
        };
        let ses = store.add_session_update(&update, None).await.unwrap();
        for i in 0..3 {
            store.add_transaction(ses, i, &tx(i as u64)).await.unwrap();
        }
        store.add_signature_after(ses, 1, &signature).await.unwrap();

        let row = store
            .get_single_co_value_session(co_value, &session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.row_id, ses);
        assert_eq!(row.last_idx, 3);
        assert_eq!(row.last_signature, signature);
        assert_eq!(row.bytes_since_last_signature, 120);

        let txs = store.get_new_transactions_in_session(ses, 1, 2).await.unwrap();
        assert_eq!(txs.iter().map(|t| t.idx).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(txs[0].tx, tx(1));

        let sigs = store.get_signatures(ses, 0).await.unwrap();
        assert_eq!(sigs.len(), 1);
        assert_eq!(sigs[0].idx, 1);

        // Updating through the existing row keeps the row id.
        let update = SessionUpdate { last_idx: 4, ..update };
        assert_eq!(store.add_session_update(&update, Some(&row)).await.unwrap(), ses);
        assert_eq!(store.get_co_value_sessions(co_value).await.unwrap()[0].last_idx, 4);
    }

    #[tokio::test]
    async fn test_failed_transaction_rolls_back() {
        let store = SqliteStore::open_memory().unwrap();
        let header = header();
        let planted = header.clone();

        let result = store
            .transaction(Box::new(move |txn| {
                txn.add_co_value(&planted)?;
                Err(StoreError::Aborted("boom".into()))
            }))
            .await;
        assert!(matches!(result, Err(StoreError::Aborted(_))));
        assert!(store.get_co_value(&header.id()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_transactions_are_isolated() {
        let store = Arc::new(SqliteStore::open_memory().unwrap());
        let good = header();
        let bad = header();

        let (a, b) = {
            let good = good.clone();
            let bad = bad.clone();
            let s1 = store.clone();
            let s2 = store.clone();
            tokio::join!(
                async move { s1.add_co_value(&good).await },
                async move {
                    s2.transaction(Box::new(move |txn| {
                        txn.add_co_value(&bad)?;
                        Err(StoreError::Aborted("nope".into()))
                    }))
                    .await
                }
            )
        };
        assert!(a.is_ok());
        assert!(b.is_err());
        assert!(store.get_co_value(&good.id()).await.unwrap().is_some());
        assert!(store.get_co_value(&bad.id()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_rows_are_unavailable() {
        let store = SqliteStore::open_memory().unwrap();
        let id = CoValueId::from_bytes([7; 32]);
        store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO coValues (id, header) VALUES (?1, 'not json')",
                params![id.to_string()],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO transactions (ses, idx, tx) VALUES (1, 0, '{\"privacy\":')",
                [],
            )
            .unwrap();
        });

        assert!(store.get_co_value(&id).await.unwrap().is_none());
        assert!(store.get_new_transactions_in_session(1, 0, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_backed_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coval.db");
        let header = header();

        {
            let store = SqliteStore::open(&path).unwrap();
            store.add_co_value(&header).await.unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert!(store.get_co_value(&header.id()).await.unwrap().is_some());
    }
}
