//! Content messages: new transactions for one CoValue.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::crypto::Ed25519Signature;
use crate::header::CoValueHeader;
use crate::ids::{CoValueId, SessionId};
use crate::known_state::SessionCounts;
use crate::transaction::Transaction;

/// New transactions for one session, continuing after `after`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionNewContent {
    pub after: u32,
    pub new_transactions: Vec<Transaction>,
    pub last_signature: Ed25519Signature,
}

impl SessionNewContent {
    /// Session count once this content is applied.
    pub fn count_after(&self) -> u32 {
        self.after + self.new_transactions.len() as u32
    }
}

/// Header and/or session content for one CoValue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewContentMessage {
    pub id: CoValueId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<CoValueHeader>,
    #[serde(default)]
    pub new: BTreeMap<SessionId, SessionNewContent>,
    /// Set on the first chunk of a multi-part transfer: the counts the
    /// receiver will have once every chunk has arrived.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expect_content_until: Option<SessionCounts>,
}

impl NewContentMessage {
    /// A message with nothing in it yet.
    pub fn empty(id: CoValueId) -> Self {
        Self {
            id,
            header: None,
            new: BTreeMap::new(),
            expect_content_until: None,
        }
    }

    /// True if the message carries neither header nor transactions.
    pub fn is_empty(&self) -> bool {
        self.header.is_none() && self.new.is_empty()
    }

    /// Number of transactions carried.
    pub fn transaction_count(&self) -> usize {
        self.new.values().map(|s| s.new_transactions.len()).sum()
    }

    /// Fold a later message for the same CoValue into this one.
    ///
    /// Sessions in `other` must continue where this message ends, otherwise
    /// they replace the entry.
    pub fn merge_from(&mut self, other: NewContentMessage) {
        if self.header.is_none() {
            self.header = other.header;
        }
        for (session, content) in other.new {
            match self.new.get_mut(&session) {
                Some(existing) if existing.count_after() == content.after => {
                    existing.new_transactions.extend(content.new_transactions);
                    existing.last_signature = content.last_signature;
                }
                _ => {
                    self.new.insert(session, content);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::AgentSecret;
    use serde_json::json;

    fn tx(n: u64) -> Transaction {
        Transaction::Trusting {
            changes: json!([n]),
            made_at: n,
            meta: None,
            group_at: None,
        }
    }

    #[test]
    fn test_wire_field_names() {
        let session = SessionId::new_random(AgentSecret::generate().agent_id());
        let mut msg = NewContentMessage::empty(CoValueId::from_bytes([1; 32]));
        msg.new.insert(
            session,
            SessionNewContent {
                after: 0,
                new_transactions: vec![tx(1)],
                last_signature: Ed25519Signature::ZERO,
            },
        );
        let json = serde_json::to_value(&msg).unwrap();
        let entry = &json["new"][session.to_string()];
        assert_eq!(entry["after"], 0);
        assert!(entry["newTransactions"].is_array());
        assert!(entry["lastSignature"].as_str().unwrap().starts_with("signature_z"));
        assert!(json.get("header").is_none());
        assert!(json.get("expectContentUntil").is_none());
    }

    #[test]
    fn test_merge_from_appends_contiguous() {
        let session = SessionId::new_random(AgentSecret::generate().agent_id());
        let id = CoValueId::from_bytes([1; 32]);
        let piece = |after, n| {
            let mut msg = NewContentMessage::empty(id);
            msg.new.insert(
                session,
                SessionNewContent {
                    after,
                    new_transactions: vec![tx(n)],
                    last_signature: Ed25519Signature::ZERO,
                },
            );
            msg
        };

        let mut batch = piece(0, 0);
        batch.merge_from(piece(1, 1));
        assert_eq!(batch.new[&session].count_after(), 2);
        assert_eq!(batch.transaction_count(), 2);
    }
}
