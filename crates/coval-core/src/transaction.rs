//! Transactions: one signed, ordered batch of changes in a session.
//!
//! A transaction is either trusting (plaintext changes) or private (changes
//! encrypted under a group read key named by `keyUsed`). Both are signed
//! through the session log's running hash.
//!
//! Transactions on groups and group-owned values carry `groupAt`: the
//! group's transaction counts the author had seen when writing. Permissions
//! are judged at that causal position; `madeAt` only orders concurrent
//! changes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::canonical::canonical_transaction_bytes;
use crate::cipher::EncryptionKey;
use crate::error::CoreError;
use crate::ids::{CoValueId, KeyId, SessionId};
use crate::known_state::SessionCounts;

/// A stored transaction, as it appears on the wire and on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "privacy", rename_all = "camelCase")]
pub enum Transaction {
    #[serde(rename_all = "camelCase")]
    Trusting {
        changes: Value,
        made_at: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        meta: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group_at: Option<SessionCounts>,
    },

    #[serde(rename_all = "camelCase")]
    Private {
        encrypted_changes: String,
        key_used: KeyId,
        made_at: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        encrypted_meta: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group_at: Option<SessionCounts>,
    },
}

/// How a new transaction should be written.
#[derive(Debug, Clone, Copy)]
pub enum Privacy<'a> {
    Trusting,
    Private { key_id: KeyId, key: &'a EncryptionKey },
}

/// Privacy flag without key material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrivacyKind {
    Trusting,
    Private,
}

/// Structured transaction metadata used by branching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TransactionMeta {
    /// Written on the target when branch content is folded in.
    MergeCommit {
        merge: BTreeMap<SessionId, u32>,
        id: CoValueId,
        count: usize,
    },

    /// Written on a branch; records the source's sessions at fork time.
    BranchCommit { from: BTreeMap<SessionId, u32> },
}

impl Transaction {
    /// Build a transaction, encrypting changes and meta when private.
    pub fn seal(
        changes: &[Value],
        meta: Option<&TransactionMeta>,
        privacy: Privacy<'_>,
        made_at: u64,
    ) -> Result<Self, CoreError> {
        Self::seal_at(changes, meta, privacy, None, made_at)
    }

    /// Like [`Transaction::seal`], recording the group position the
    /// author wrote at.
    pub fn seal_at(
        changes: &[Value],
        meta: Option<&TransactionMeta>,
        privacy: Privacy<'_>,
        group_at: Option<&SessionCounts>,
        made_at: u64,
    ) -> Result<Self, CoreError> {
        let group_at = group_at.cloned();
        let changes_json = Value::Array(changes.to_vec());
        let meta_json = meta
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| CoreError::EncodingError(e.to_string()))?;

        match privacy {
            Privacy::Trusting => Ok(Transaction::Trusting {
                changes: changes_json,
                made_at,
                meta: meta_json,
                group_at,
            }),
            Privacy::Private { key_id, key } => {
                let encrypted_changes = key.seal_to_hex(changes_json.to_string().as_bytes())?;
                let encrypted_meta = meta_json
                    .map(|m| key.seal_to_hex(m.to_string().as_bytes()))
                    .transpose()?;
                Ok(Transaction::Private {
                    encrypted_changes,
                    key_used: key_id,
                    made_at,
                    encrypted_meta,
                    group_at,
                })
            }
        }
    }

    /// Informational creation time in milliseconds.
    pub fn made_at(&self) -> u64 {
        match self {
            Transaction::Trusting { made_at, .. } | Transaction::Private { made_at, .. } => {
                *made_at
            }
        }
    }

    /// Group transaction counts the author had seen, if recorded.
    pub fn group_at(&self) -> Option<&SessionCounts> {
        match self {
            Transaction::Trusting { group_at, .. } | Transaction::Private { group_at, .. } => {
                group_at.as_ref()
            }
        }
    }

    pub fn privacy(&self) -> PrivacyKind {
        match self {
            Transaction::Trusting { .. } => PrivacyKind::Trusting,
            Transaction::Private { .. } => PrivacyKind::Private,
        }
    }

    /// The read key a private transaction was encrypted with.
    pub fn key_used(&self) -> Option<KeyId> {
        match self {
            Transaction::Private { key_used, .. } => Some(*key_used),
            Transaction::Trusting { .. } => None,
        }
    }

    /// Canonical bytes covered by the session signature.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        canonical_transaction_bytes(self)
    }

    /// The change list. Private transactions need the key named by `keyUsed`.
    pub fn decrypt_changes(&self, key: Option<&EncryptionKey>) -> Result<Vec<Value>, CoreError> {
        let value = match self {
            Transaction::Trusting { changes, .. } => changes.clone(),
            Transaction::Private {
                encrypted_changes, ..
            } => {
                let key = key.ok_or_else(|| CoreError::DecryptionError("no key".into()))?;
                parse_json(&key.open_hex(encrypted_changes)?)?
            }
        };
        match value {
            Value::Array(changes) => Ok(changes),
            other => Err(CoreError::DecodingError(format!(
                "changes must be an array, got {other}"
            ))),
        }
    }

    /// The structured meta, if any.
    pub fn decrypt_meta(
        &self,
        key: Option<&EncryptionKey>,
    ) -> Result<Option<TransactionMeta>, CoreError> {
        let value = match self {
            Transaction::Trusting { meta, .. } => meta.clone(),
            Transaction::Private { encrypted_meta, .. } => match encrypted_meta {
                Some(sealed) => {
                    let key = key.ok_or_else(|| CoreError::DecryptionError("no key".into()))?;
                    Some(parse_json(&key.open_hex(sealed)?)?)
                }
                None => None,
            },
        };
        value
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| CoreError::DecodingError(e.to_string()))
    }
}

fn parse_json(bytes: &[u8]) -> Result<Value, CoreError> {
    serde_json::from_slice(bytes).map_err(|e| CoreError::DecodingError(e.to_string()))
}

/// Position of a transaction: its session and index within that session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxId {
    pub session: SessionId,
    pub idx: u32,
}

/// A transaction whose changes have been decrypted.
#[derive(Debug, Clone, PartialEq)]
pub struct DecryptedTransaction {
    pub tx_id: TxId,
    pub made_at: u64,
    pub group_at: Option<SessionCounts>,
    pub privacy: PrivacyKind,
    pub changes: Vec<Value>,
    pub meta: Option<TransactionMeta>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_trusting_wire_shape() {
        let tx = Transaction::seal(&[json!({"op": "set", "key": "a", "value": 1})], None, Privacy::Trusting, 42)
            .unwrap();
        let json = serde_json::to_value(&tx).unwrap();
        assert_eq!(json["privacy"], "trusting");
        assert_eq!(json["madeAt"], 42);
        assert!(json.get("meta").is_none());
        assert!(json.get("groupAt").is_none());
    }

    #[test]
    fn test_group_position_is_on_the_wire() {
        let seen = SessionCounts::new();
        let tx = Transaction::seal_at(&[], None, Privacy::Trusting, Some(&seen), 1).unwrap();
        let json = serde_json::to_value(&tx).unwrap();
        assert_eq!(json["groupAt"], json!({}));
        let back: Transaction = serde_json::from_value(json).unwrap();
        assert_eq!(back.group_at(), Some(&seen));
        assert_ne!(
            back.canonical_bytes(),
            Transaction::seal(&[], None, Privacy::Trusting, 1).unwrap().canonical_bytes()
        );
    }

    #[test]
    fn test_private_roundtrip() {
        let key = EncryptionKey::generate();
        let key_id = KeyId::generate();
        let meta = TransactionMeta::BranchCommit { from: BTreeMap::new() };
        let tx = Transaction::seal(
            &[json!({"op": "set", "key": "secret", "value": "x"})],
            Some(&meta),
            Privacy::Private { key_id, key: &key },
            7,
        )
        .unwrap();

        assert_eq!(tx.key_used(), Some(key_id));
        assert!(tx.decrypt_changes(None).is_err());
        assert!(tx.decrypt_changes(Some(&EncryptionKey::generate())).is_err());

        let changes = tx.decrypt_changes(Some(&key)).unwrap();
        assert_eq!(changes[0]["key"], "secret");
        assert_eq!(tx.decrypt_meta(Some(&key)).unwrap(), Some(meta));
    }

    #[test]
    fn test_merge_commit_meta_shape() {
        let meta = TransactionMeta::MergeCommit {
            merge: BTreeMap::new(),
            id: CoValueId::from_bytes([3; 32]),
            count: 2,
        };
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["count"], 2);
        let back: TransactionMeta = serde_json::from_value(json).unwrap();
        assert_eq!(back, meta);

        let branch: TransactionMeta = serde_json::from_value(json!({"from": {}})).unwrap();
        assert!(matches!(branch, TransactionMeta::BranchCommit { .. }));
    }

    #[test]
    fn test_non_array_changes_rejected() {
        let tx = Transaction::Trusting {
            changes: json!({"not": "a list"}),
            made_at: 0,
            meta: None,
            group_at: None,
        };
        assert!(tx.decrypt_changes(None).is_err());
    }
}
