//! Group state computation.
//!
//! A group is a CoValue whose changes are map ops (`{"op":"set",key,value}`).
//! Group state is computed by replaying those transactions in causal order.
//! A transaction becomes ready once its session predecessor and everything
//! named in its `groupAt` have been replayed; among ready transactions the
//! smallest `(madeAt, txId)` goes first. Each transaction is checked against
//! the state built so far and applied atomically, or skipped entirely.
//! Transactions without `groupAt` are skipped.
//!
//! Keys of the group map:
//! - `<agentId>` → role
//! - `readKey` → current read key id
//! - `<keyId>_for_<agentId>` → [`KeyRevelation`] of that key to that agent
//! - `<keyId>_for_<keyId>` → older key sealed under a newer one

use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};

use coval_core::{
    sessions_cover, AgentId, AgentSecret, CoValueHeader, CoValueId, DecryptedTransaction,
    EncryptionKey, KeyId, Ruleset, SessionCounts, SessionId, TxId,
};

use crate::error::{PermsError, Result};
use crate::keys::{open_previous_key, KeyRevelation};
use crate::role::Role;

/// One group change.
#[derive(Debug, Clone, PartialEq)]
pub enum GroupOp {
    SetRole { agent: AgentId, role: Role },
    SetReadKey { key_id: KeyId },
    RevealKey { key_id: KeyId, to: AgentId, revelation: KeyRevelation },
    ChainKey { key_id: KeyId, under: KeyId, sealed: String },
}

impl GroupOp {
    /// The map op this group change is written as.
    pub fn to_change(&self) -> Value {
        let (key, value) = match self {
            GroupOp::SetRole { agent, role } => (agent.to_string(), json!(role.as_str())),
            GroupOp::SetReadKey { key_id } => ("readKey".to_string(), json!(key_id.to_string())),
            GroupOp::RevealKey {
                key_id,
                to,
                revelation,
            } => (format!("{key_id}_for_{to}"), json!(revelation)),
            GroupOp::ChainKey {
                key_id,
                under,
                sealed,
            } => (format!("{key_id}_for_{under}"), json!(sealed)),
        };
        json!({"op": "set", "key": key, "value": value})
    }

    /// Parse a map op back into a group change.
    pub fn parse(change: &Value) -> Result<Self> {
        let invalid = || PermsError::InvalidOp(change.to_string());
        if change.get("op").and_then(Value::as_str) != Some("set") {
            return Err(invalid());
        }
        let key = change.get("key").and_then(Value::as_str).ok_or_else(invalid)?;
        let value = change.get("value").ok_or_else(invalid)?;

        if key == "readKey" {
            let key_id = value.as_str().ok_or_else(invalid)?.parse()?;
            return Ok(GroupOp::SetReadKey { key_id });
        }
        if let Some((key_id, target)) = key.split_once("_for_") {
            let key_id = key_id.parse()?;
            if target.starts_with("key_z") {
                return Ok(GroupOp::ChainKey {
                    key_id,
                    under: target.parse()?,
                    sealed: value.as_str().ok_or_else(invalid)?.to_string(),
                });
            }
            let revelation = serde_json::from_value(value.clone())
                .map_err(|e| PermsError::SerializationError(e.to_string()))?;
            return Ok(GroupOp::RevealKey {
                key_id,
                to: target.parse()?,
                revelation,
            });
        }

        let agent = key.parse()?;
        let role = value.as_str().ok_or_else(invalid)?.parse()?;
        Ok(GroupOp::SetRole { agent, role })
    }
}

/// A role assignment, made by the group transaction `tx_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RoleChange {
    tx_id: TxId,
    role: Role,
}

/// Replayed state of a group.
#[derive(Debug, Clone)]
pub struct GroupState {
    id: CoValueId,
    initial_admin: AgentId,
    roles: HashMap<AgentId, Vec<RoleChange>>,
    read_key: Option<KeyId>,
    revelations: HashMap<(KeyId, AgentId), KeyRevelation>,
    key_chain: HashMap<KeyId, Vec<(KeyId, String)>>,
    valid: HashSet<TxId>,
    processed: SessionCounts,
}

impl GroupState {
    /// Replay group transactions into a state.
    ///
    /// `transactions` may be in any order; they are ordered causally here.
    /// Transactions whose dependencies never arrive are left out, along with
    /// the rest of their session.
    pub fn replay(header: &CoValueHeader, transactions: &[DecryptedTransaction]) -> Result<Self> {
        let id = header.id();
        let initial_admin = match &header.ruleset {
            Ruleset::Group { initial_admin } => *initial_admin,
            _ => return Err(PermsError::NotAGroup(id)),
        };

        let mut state = Self {
            id,
            initial_admin,
            roles: HashMap::new(),
            read_key: None,
            revelations: HashMap::new(),
            key_chain: HashMap::new(),
            valid: HashSet::new(),
            processed: SessionCounts::new(),
        };

        let mut by_session: BTreeMap<SessionId, BTreeMap<u32, &DecryptedTransaction>> =
            BTreeMap::new();
        for tx in transactions {
            by_session
                .entry(tx.tx_id.session)
                .or_default()
                .insert(tx.tx_id.idx, tx);
        }

        loop {
            let next = by_session
                .iter()
                .filter_map(|(session, txs)| {
                    let tx = txs.get(&state.processed_count(session)).copied()?;
                    state.is_ready(tx).then_some(tx)
                })
                .min_by_key(|tx| (tx.made_at, tx.tx_id));
            let Some(tx) = next else { break };

            state.processed.insert(tx.tx_id.session, tx.tx_id.idx + 1);
            if tx.group_at.is_some() {
                state.apply_transaction(tx);
            }
        }

        Ok(state)
    }

    fn processed_count(&self, session: &SessionId) -> u32 {
        self.processed.get(session).copied().unwrap_or(0)
    }

    fn is_ready(&self, tx: &DecryptedTransaction) -> bool {
        tx.group_at
            .as_ref()
            .map_or(true, |seen| sessions_cover(&self.processed, seen))
    }

    fn apply_transaction(&mut self, tx: &DecryptedTransaction) {
        let mut scratch = self.clone();
        let applied = tx.changes.iter().all(|change| {
            GroupOp::parse(change)
                .map(|op| scratch.apply(tx.tx_id.session.agent, tx.tx_id, op))
                .unwrap_or(false)
        });
        if applied {
            scratch.valid.insert(tx.tx_id);
            *self = scratch;
        }
    }

    /// Apply one op from `author`; returns false if the author may not.
    fn apply(&mut self, author: AgentId, tx_id: TxId, op: GroupOp) -> bool {
        let author_role = self.role(&author);
        let is_admin = author_role.map_or(false, |r| r.can_admin());

        match op {
            GroupOp::SetRole { agent, role } => {
                let bootstrap = author_role.is_none()
                    && author == self.initial_admin
                    && agent == author
                    && role == Role::Admin;
                let demotes_other_admin = agent != author
                    && self.role(&agent) == Some(Role::Admin)
                    && role != Role::Admin;
                if !(bootstrap || (is_admin && !demotes_other_admin)) {
                    return false;
                }
                self.roles
                    .entry(agent)
                    .or_default()
                    .push(RoleChange { tx_id, role });
            }
            GroupOp::SetReadKey { key_id } => {
                if !is_admin {
                    return false;
                }
                self.read_key = Some(key_id);
            }
            GroupOp::RevealKey {
                key_id,
                to,
                revelation,
            } => {
                if !is_admin {
                    return false;
                }
                self.revelations.insert((key_id, to), revelation);
            }
            GroupOp::ChainKey {
                key_id,
                under,
                sealed,
            } => {
                if !is_admin {
                    return false;
                }
                self.key_chain.entry(key_id).or_default().push((under, sealed));
            }
        }
        true
    }

    pub fn id(&self) -> CoValueId {
        self.id
    }

    /// Current role of `agent`.
    pub fn role(&self, agent: &AgentId) -> Option<Role> {
        self.roles
            .get(agent)
            .and_then(|changes| changes.last())
            .map(|c| c.role)
    }

    /// Role of `agent` as seen by someone who had replayed the group
    /// transactions counted in `position`.
    pub fn role_at(&self, agent: &AgentId, position: &SessionCounts) -> Option<Role> {
        self.roles
            .get(agent)?
            .iter()
            .filter(|c| c.tx_id.idx < position.get(&c.tx_id.session).copied().unwrap_or(0))
            .last()
            .map(|c| c.role)
    }

    /// Transaction counts replayed so far; new writes record this as `groupAt`.
    pub fn position(&self) -> &SessionCounts {
        &self.processed
    }

    /// Whether replay has reached everything counted in `position`.
    pub fn covers(&self, position: &SessionCounts) -> bool {
        sessions_cover(&self.processed, position)
    }

    /// Agents with a current role other than revoked.
    pub fn members(&self) -> Vec<(AgentId, Role)> {
        let mut members: Vec<(AgentId, Role)> = self
            .roles
            .keys()
            .filter_map(|agent| self.role(agent).map(|r| (*agent, r)))
            .filter(|(_, role)| *role != Role::Revoked)
            .collect();
        members.sort_by_key(|(agent, _)| *agent);
        members
    }

    /// Whether the group transaction `tx_id` was accepted by replay.
    pub fn is_valid_group_transaction(&self, tx_id: &TxId) -> bool {
        self.valid.contains(tx_id)
    }

    /// The key new private transactions should use.
    pub fn current_read_key_id(&self) -> Option<KeyId> {
        self.read_key
    }

    /// Resolve read key `key_id` for `agent`.
    ///
    /// Uses a direct revelation if there is one, otherwise walks forward
    /// through newer keys that seal it.
    pub fn read_key(&self, key_id: KeyId, agent: &AgentSecret) -> Result<EncryptionKey> {
        let mut visited = HashSet::new();
        self.resolve_key(key_id, agent, &mut visited)
    }

    /// Resolve the current read key for `agent`.
    pub fn current_read_key(&self, agent: &AgentSecret) -> Result<(KeyId, EncryptionKey)> {
        let key_id = self
            .read_key
            .ok_or_else(|| PermsError::KeyNotRevealed("group has no read key".into()))?;
        Ok((key_id, self.read_key(key_id, agent)?))
    }

    fn resolve_key(
        &self,
        key_id: KeyId,
        agent: &AgentSecret,
        visited: &mut HashSet<KeyId>,
    ) -> Result<EncryptionKey> {
        if !visited.insert(key_id) {
            return Err(PermsError::KeyNotRevealed(key_id.to_string()));
        }
        if let Some(revelation) = self.revelations.get(&(key_id, agent.agent_id())) {
            return revelation.open(key_id, &agent.sealer);
        }
        for (newer, sealed) in self.key_chain.get(&key_id).into_iter().flatten() {
            if let Ok(newer_key) = self.resolve_key(*newer, agent, visited) {
                return open_previous_key(sealed, &newer_key);
            }
        }
        Err(PermsError::KeyNotRevealed(key_id.to_string()))
    }
}
