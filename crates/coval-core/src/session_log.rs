//! Session logs.
//!
//! A session log is the append-only list of transactions one agent-session
//! wrote to one CoValue. Transactions are chained through a running Blake3
//! hash; the session's agent signs that hash after every batch:
//!
//! ```text
//! h_n = blake3(len(tx_0) || tx_0 || ... || len(tx_{n-1}) || tx_{n-1})
//! sig = ed25519_sign(agent.signer, "coval-session-v0:" || session_id || h_n)
//! ```
//!
//! Once more than `checkpoint_bytes` of transactions accumulate since the
//! previous checkpoint, the current signature is kept as a checkpoint
//! (`signatureAfter`). Checkpoints are where content is split into chunks.

use serde_json::Value;
use std::collections::BTreeMap;

use crate::cipher::EncryptionKey;
use crate::crypto::{Blake3Hash, Ed25519Signature, Keypair};
use crate::error::{CoreError, ValidationError};
use crate::ids::SessionId;
use crate::known_state::SessionCounts;
use crate::transaction::{Privacy, Transaction, TransactionMeta};

/// Domain separator for session signatures.
pub const SESSION_SIGNATURE_DOMAIN: &[u8] = b"coval-session-v0:";

/// Default checkpoint threshold (100 KiB).
pub const DEFAULT_CHECKPOINT_BYTES: usize = 100 * 1024;

/// A contiguous run of transactions ending in a signature.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionPiece {
    /// Number of transactions before the piece.
    pub after: u32,
    pub transactions: Vec<Transaction>,
    /// Signature over the log up to the end of the piece.
    pub signature: Ed25519Signature,
}

/// A signature accepted on trust, still to be checked.
#[derive(Debug, Clone)]
struct PendingSignature {
    start: u32,
    previous_signature: Option<Ed25519Signature>,
    hash: Blake3Hash,
    signature: Ed25519Signature,
}

/// The transactions of one session, with their signatures.
#[derive(Debug, Clone)]
pub struct SessionLog {
    session_id: SessionId,
    transactions: Vec<Transaction>,
    hasher: blake3::Hasher,
    last_signature: Option<Ed25519Signature>,
    signature_after: BTreeMap<u32, Ed25519Signature>,
    bytes_since_last_signature: usize,
    checkpoint_bytes: usize,
    pending: Vec<PendingSignature>,
}

impl SessionLog {
    /// An empty log.
    pub fn new(session_id: SessionId, checkpoint_bytes: usize) -> Self {
        Self {
            session_id,
            transactions: Vec::new(),
            hasher: blake3::Hasher::new(),
            last_signature: None,
            signature_after: BTreeMap::new(),
            bytes_since_last_signature: 0,
            checkpoint_bytes,
            pending: Vec::new(),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn tx_count(&self) -> u32 {
        self.transactions.len() as u32
    }

    pub fn last_signature(&self) -> Option<Ed25519Signature> {
        self.last_signature
    }

    /// Checkpoint signatures, keyed by the index of the last covered transaction.
    pub fn signature_checkpoints(&self) -> &BTreeMap<u32, Ed25519Signature> {
        &self.signature_after
    }

    pub fn bytes_since_last_signature(&self) -> usize {
        self.bytes_since_last_signature
    }

    /// Whether every signature in this log has been checked.
    pub fn is_verified(&self) -> bool {
        self.pending.is_empty()
    }

    /// Number of leading transactions whose signatures have been checked.
    pub fn verified_count(&self) -> u32 {
        self.pending
            .first()
            .map(|p| p.start)
            .unwrap_or_else(|| self.tx_count())
    }

    /// The running hash over all transactions.
    pub fn current_hash(&self) -> Blake3Hash {
        Blake3Hash::from_bytes(*self.hasher.finalize().as_bytes())
    }

    /// The message signed for a given running hash.
    pub fn signing_message(session_id: &SessionId, hash: &Blake3Hash) -> Vec<u8> {
        let session = session_id.to_string();
        let mut msg = Vec::with_capacity(SESSION_SIGNATURE_DOMAIN.len() + session.len() + 32);
        msg.extend_from_slice(SESSION_SIGNATURE_DOMAIN);
        msg.extend_from_slice(session.as_bytes());
        msg.extend_from_slice(hash.as_bytes());
        msg
    }

    /// Append a batch received from elsewhere.
    ///
    /// Unless `trust_signature` is set, `claimed_signature` must verify over
    /// the running hash after the batch. Trusted batches are appended
    /// immediately and checked later by [`SessionLog::ensure_verified`].
    /// On rejection the log is unchanged.
    pub fn try_add(
        &mut self,
        new_transactions: Vec<Transaction>,
        claimed_signature: Ed25519Signature,
        trust_signature: bool,
    ) -> Result<(), ValidationError> {
        if new_transactions.is_empty() {
            return Err(ValidationError::EmptyBatch(self.session_id));
        }

        let mut hasher = self.hasher.clone();
        let mut batch_bytes = 0;
        for tx in &new_transactions {
            batch_bytes += hash_transaction(&mut hasher, tx);
        }
        let hash = Blake3Hash::from_bytes(*hasher.finalize().as_bytes());

        if trust_signature {
            self.pending.push(PendingSignature {
                start: self.tx_count(),
                previous_signature: self.last_signature,
                hash,
                signature: claimed_signature,
            });
        } else {
            self.verify(&hash, &claimed_signature)?;
        }

        self.transactions.extend(new_transactions);
        self.commit(hasher, claimed_signature, batch_bytes);
        Ok(())
    }

    /// Append a locally created transaction and sign the new log state.
    pub fn add_new_transaction(
        &mut self,
        changes: &[Value],
        meta: Option<&TransactionMeta>,
        privacy: Privacy<'_>,
        signer: &Keypair,
        made_at: u64,
    ) -> Result<Ed25519Signature, CoreError> {
        self.add_new_transaction_at(changes, meta, privacy, None, signer, made_at)
    }

    /// Like [`SessionLog::add_new_transaction`], recording the group
    /// position the transaction was written at.
    pub fn add_new_transaction_at(
        &mut self,
        changes: &[Value],
        meta: Option<&TransactionMeta>,
        privacy: Privacy<'_>,
        group_at: Option<&SessionCounts>,
        signer: &Keypair,
        made_at: u64,
    ) -> Result<Ed25519Signature, CoreError> {
        if signer.public_key() != self.session_id.agent.signer {
            return Err(CoreError::WrongSigner {
                session: self.session_id,
            });
        }

        let tx = Transaction::seal_at(changes, meta, privacy, group_at, made_at)?;
        let mut hasher = self.hasher.clone();
        let bytes = hash_transaction(&mut hasher, &tx);
        let hash = Blake3Hash::from_bytes(*hasher.finalize().as_bytes());
        let signature = signer.sign(&Self::signing_message(&self.session_id, &hash));

        self.transactions.push(tx);
        self.commit(hasher, signature, bytes);
        Ok(signature)
    }

    /// Changes of the transaction at `idx`, decrypting private ones with `key`.
    pub fn decrypt_transaction(
        &self,
        idx: u32,
        key: Option<&EncryptionKey>,
    ) -> Result<Vec<Value>, CoreError> {
        self.get(idx)?.decrypt_changes(key)
    }

    /// Meta of the transaction at `idx`.
    pub fn decrypt_meta(
        &self,
        idx: u32,
        key: Option<&EncryptionKey>,
    ) -> Result<Option<TransactionMeta>, CoreError> {
        self.get(idx)?.decrypt_meta(key)
    }

    /// Check every signature accepted on trust.
    ///
    /// If one fails, the log is cut back to where the failing batch started
    /// and the error is returned.
    pub fn ensure_verified(&mut self) -> Result<(), ValidationError> {
        for p in std::mem::take(&mut self.pending) {
            if let Err(e) = self.verify(&p.hash, &p.signature) {
                self.truncate(p.start, p.previous_signature);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Split everything after `after` into signed pieces ending at checkpoints.
    pub fn pieces_after(&self, after: u32) -> Vec<SessionPiece> {
        self.pieces_between(after, u32::MAX)
    }

    /// Signed pieces covering `after..end`, where `end` is the last signed
    /// boundary not beyond `until`. Transactions past a limit that falls
    /// between signatures are held back with the rest of their batch.
    pub fn pieces_between(&self, after: u32, until: u32) -> Vec<SessionPiece> {
        let Some((end, end_signature)) = self.signed_boundary(until) else {
            return Vec::new();
        };
        if after >= end {
            return Vec::new();
        }

        let mut pieces = Vec::new();
        let mut start = after;
        for (&idx, signature) in self.signature_after.range(after..end) {
            if idx + 1 >= end {
                break;
            }
            pieces.push(SessionPiece {
                after: start,
                transactions: self.transactions[start as usize..=idx as usize].to_vec(),
                signature: *signature,
            });
            start = idx + 1;
        }
        pieces.push(SessionPiece {
            after: start,
            transactions: self.transactions[start as usize..end as usize].to_vec(),
            signature: end_signature,
        });
        pieces
    }

    /// The largest transaction count at most `limit` that a signature covers.
    pub fn signed_boundary(&self, limit: u32) -> Option<(u32, Ed25519Signature)> {
        let count = self.tx_count();
        if limit >= count {
            return self.last_signature.map(|signature| (count, signature));
        }
        self.signature_after
            .range(..limit)
            .next_back()
            .map(|(&idx, signature)| (idx + 1, *signature))
    }

    fn get(&self, idx: u32) -> Result<&Transaction, CoreError> {
        self.transactions
            .get(idx as usize)
            .ok_or(CoreError::TransactionNotFound {
                session: self.session_id,
                idx,
            })
    }

    fn verify(&self, hash: &Blake3Hash, signature: &Ed25519Signature) -> Result<(), ValidationError> {
        self.session_id
            .agent
            .signer
            .verify(&Self::signing_message(&self.session_id, hash), signature)
            .map_err(|_| ValidationError::SignatureFailed(self.session_id))
    }

    fn commit(&mut self, hasher: blake3::Hasher, signature: Ed25519Signature, bytes: usize) {
        self.hasher = hasher;
        self.last_signature = Some(signature);
        self.bytes_since_last_signature += bytes;
        if self.bytes_since_last_signature > self.checkpoint_bytes {
            self.signature_after.insert(self.tx_count() - 1, signature);
            self.bytes_since_last_signature = 0;
        }
    }

    /// Drop everything from `count` on and rebuild the running state.
    fn truncate(&mut self, count: u32, last_signature: Option<Ed25519Signature>) {
        self.transactions.truncate(count as usize);
        self.signature_after.retain(|idx, _| *idx < count);
        let checkpoint_end = self
            .signature_after
            .keys()
            .next_back()
            .map(|idx| idx + 1)
            .unwrap_or(0);

        self.hasher = blake3::Hasher::new();
        self.bytes_since_last_signature = 0;
        for (idx, tx) in self.transactions.iter().enumerate() {
            let bytes = hash_transaction(&mut self.hasher, tx);
            if idx as u32 >= checkpoint_end {
                self.bytes_since_last_signature += bytes;
            }
        }
        self.last_signature = last_signature;
    }
}

/// Feed one transaction into the running hash; returns its encoded size.
fn hash_transaction(hasher: &mut blake3::Hasher, tx: &Transaction) -> usize {
    let bytes = tx.canonical_bytes();
    hasher.update(&(bytes.len() as u64).to_le_bytes());
    hasher.update(&bytes);
    bytes.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::AgentSecret;
    use proptest::prelude::*;
    use serde_json::json;

    fn new_log(agent: &AgentSecret, checkpoint_bytes: usize) -> SessionLog {
        SessionLog::new(SessionId::new_random(agent.agent_id()), checkpoint_bytes)
    }

    fn write(log: &mut SessionLog, agent: &AgentSecret, n: usize) -> Ed25519Signature {
        let mut sig = Ed25519Signature::ZERO;
        for i in 0..n {
            sig = log
                .add_new_transaction(
                    &[json!({"op": "set", "key": format!("k{i}"), "value": i})],
                    None,
                    Privacy::Trusting,
                    &agent.signer,
                    i as u64,
                )
                .unwrap();
        }
        sig
    }

    #[test]
    fn test_replica_accepts_signed_batch() {
        let agent = AgentSecret::generate();
        let mut log = new_log(&agent, DEFAULT_CHECKPOINT_BYTES);
        let sig = write(&mut log, &agent, 3);

        let mut replica = SessionLog::new(log.session_id(), DEFAULT_CHECKPOINT_BYTES);
        replica
            .try_add(log.transactions().to_vec(), sig, false)
            .unwrap();
        assert_eq!(replica.tx_count(), 3);
        assert_eq!(replica.current_hash(), log.current_hash());
        assert_eq!(replica.last_signature(), Some(sig));
    }

    #[test]
    fn test_rejects_wrong_signature_and_stays_unchanged() {
        let agent = AgentSecret::generate();
        let mut log = new_log(&agent, DEFAULT_CHECKPOINT_BYTES);
        write(&mut log, &agent, 2);

        let mut replica = SessionLog::new(log.session_id(), DEFAULT_CHECKPOINT_BYTES);
        let err = replica
            .try_add(log.transactions().to_vec(), Ed25519Signature::ZERO, false)
            .unwrap_err();
        assert!(matches!(err, ValidationError::SignatureFailed(_)));
        assert_eq!(replica.tx_count(), 0);
        assert_eq!(replica.last_signature(), None);
    }

    #[test]
    fn test_wrong_signer_cannot_write() {
        let owner = AgentSecret::generate();
        let intruder = AgentSecret::generate();
        let mut log = new_log(&owner, DEFAULT_CHECKPOINT_BYTES);
        let result = log.add_new_transaction(&[], None, Privacy::Trusting, &intruder.signer, 0);
        assert!(matches!(result, Err(CoreError::WrongSigner { .. })));
    }

    #[test]
    fn test_trusted_batch_verified_later() {
        let agent = AgentSecret::generate();
        let mut log = new_log(&agent, DEFAULT_CHECKPOINT_BYTES);
        let sig = write(&mut log, &agent, 2);

        let mut good = SessionLog::new(log.session_id(), DEFAULT_CHECKPOINT_BYTES);
        good.try_add(log.transactions().to_vec(), sig, true).unwrap();
        assert!(!good.is_verified());
        good.ensure_verified().unwrap();
        assert!(good.is_verified());

        let mut bad = SessionLog::new(log.session_id(), DEFAULT_CHECKPOINT_BYTES);
        bad.try_add(log.transactions().to_vec(), Ed25519Signature::ZERO, true)
            .unwrap();
        assert_eq!(bad.tx_count(), 2);
        assert!(bad.ensure_verified().is_err());
        assert_eq!(bad.tx_count(), 0);
        assert_eq!(bad.current_hash(), new_log(&agent, 0).current_hash());
    }

    #[test]
    fn test_verified_count_stops_at_first_pending_batch() {
        let agent = AgentSecret::generate();
        let mut log = new_log(&agent, DEFAULT_CHECKPOINT_BYTES);
        let first = write(&mut log, &agent, 2);
        let txs = log.transactions().to_vec();

        let mut replica = SessionLog::new(log.session_id(), DEFAULT_CHECKPOINT_BYTES);
        replica.try_add(txs[..2].to_vec(), first, false).unwrap();
        assert_eq!(replica.verified_count(), 2);

        let more = write(&mut log, &agent, 1);
        replica
            .try_add(log.transactions()[2..].to_vec(), more, true)
            .unwrap();
        assert_eq!(replica.tx_count(), 3);
        assert_eq!(replica.verified_count(), 2);
        replica.ensure_verified().unwrap();
        assert_eq!(replica.verified_count(), 3);
    }

    #[test]
    fn test_pieces_between_stop_at_signed_boundary() {
        let agent = AgentSecret::generate();
        let mut log = new_log(&agent, 1);
        write(&mut log, &agent, 4);

        let pieces = log.pieces_between(0, 2);
        assert_eq!(pieces.len(), 2);
        assert_eq!(pieces[1].after, 1);
        assert_eq!(pieces[1].transactions.len(), 1);

        let mut replica = SessionLog::new(log.session_id(), 1);
        for piece in pieces {
            replica
                .try_add(piece.transactions, piece.signature, false)
                .unwrap();
        }
        assert_eq!(replica.tx_count(), 2);

        // Without checkpoints only the full log is signed.
        let mut unsplit = new_log(&agent, DEFAULT_CHECKPOINT_BYTES);
        write(&mut unsplit, &agent, 3);
        assert!(unsplit.pieces_between(0, 2).is_empty());
        assert_eq!(unsplit.signed_boundary(2), None);
        assert_eq!(unsplit.pieces_between(0, 3).len(), 1);
    }

    #[test]
    fn test_checkpoints_split_pieces() {
        let agent = AgentSecret::generate();
        // Tiny threshold: every transaction becomes a checkpoint.
        let mut log = new_log(&agent, 1);
        write(&mut log, &agent, 4);
        assert_eq!(log.signature_checkpoints().len(), 4);

        let pieces = log.pieces_after(1);
        assert_eq!(pieces.len(), 3);
        assert_eq!(pieces[0].after, 1);
        assert_eq!(pieces[2].after, 3);

        let mut replica = SessionLog::new(log.session_id(), 1);
        for piece in log.pieces_after(0) {
            assert_eq!(piece.after, replica.tx_count());
            replica
                .try_add(piece.transactions, piece.signature, false)
                .unwrap();
        }
        assert_eq!(replica.tx_count(), 4);
    }

    #[test]
    fn test_no_pieces_when_caught_up() {
        let agent = AgentSecret::generate();
        let mut log = new_log(&agent, DEFAULT_CHECKPOINT_BYTES);
        assert!(log.pieces_after(0).is_empty());
        write(&mut log, &agent, 2);
        assert_eq!(log.pieces_after(0).len(), 1);
        assert!(log.pieces_after(2).is_empty());
    }

    #[test]
    fn test_decrypt_private_transaction() {
        let agent = AgentSecret::generate();
        let key = EncryptionKey::generate();
        let key_id = crate::ids::KeyId::generate();
        let mut log = new_log(&agent, DEFAULT_CHECKPOINT_BYTES);
        log.add_new_transaction(
            &[json!({"op": "set", "key": "a", "value": "hidden"})],
            None,
            Privacy::Private { key_id, key: &key },
            &agent.signer,
            1,
        )
        .unwrap();

        let changes = log.decrypt_transaction(0, Some(&key)).unwrap();
        assert_eq!(changes[0]["value"], "hidden");
        assert!(log.decrypt_transaction(1, Some(&key)).is_err());
    }

    proptest! {
        #[test]
        fn prop_tampering_any_byte_is_rejected(
            values in prop::collection::vec(any::<i64>(), 1..5),
            pick in any::<prop::sample::Index>(),
            flip in 1u8..=255,
        ) {
            let agent = AgentSecret::from_seed(&[11; 32]);
            let mut log = new_log(&agent, DEFAULT_CHECKPOINT_BYTES);
            let mut sig = Ed25519Signature::ZERO;
            for (i, v) in values.iter().enumerate() {
                sig = log.add_new_transaction(
                    &[json!({"op": "set", "key": "n", "value": v})],
                    None,
                    Privacy::Trusting,
                    &agent.signer,
                    i as u64,
                ).unwrap();
            }

            let mut txs = log.transactions().to_vec();
            let target = pick.index(txs.len());
            let mut text = serde_json::to_vec(&txs[target]).unwrap();
            // Flip one byte inside the numeric value so the JSON stays parseable.
            let digits: Vec<usize> = text.iter().enumerate()
                .filter(|(_, b)| b.is_ascii_digit()).map(|(i, _)| i).collect();
            let at = digits[pick.index(digits.len())];
            text[at] = b'0' + ((text[at] - b'0' + flip % 9 + 1) % 10);
            if let Ok(tampered) = serde_json::from_slice::<Transaction>(&text) {
                prop_assume!(tampered != txs[target]);
                txs[target] = tampered;
                let mut replica = SessionLog::new(log.session_id(), DEFAULT_CHECKPOINT_BYTES);
                prop_assert!(replica.try_add(txs, sig, false).is_err());
                prop_assert_eq!(replica.tx_count(), 0);
            }
        }
    }
}
