//! Which transactions count.
//!
//! A transaction is valid if its author was allowed to write it at its
//! causal position: the group transactions it records in `groupAt`. A
//! writer demoted later keeps their earlier writes; an agent never
//! authorized at that position is excluded. `madeAt` plays no part, so a
//! backdated clock cannot revive a revoked role.

use std::collections::HashMap;

use coval_core::{combine_sessions, sessions_cover, AgentId, Ruleset, SessionCounts, SessionId, TxId};

use crate::group::GroupState;

/// Whether the transaction `tx_id`, written at group position `group_at`,
/// is valid.
///
/// `group` is the replayed state of the group itself (for group CoValues)
/// or of the owning group (for owned values). Owned transactions are
/// invalid while the group has not caught up to `group_at`, and always
/// invalid without one.
pub fn is_transaction_valid(
    ruleset: &Ruleset,
    tx_id: &TxId,
    group_at: Option<&SessionCounts>,
    group: Option<&GroupState>,
) -> bool {
    match ruleset {
        Ruleset::UnsafeAllowAll => true,
        Ruleset::Group { .. } => group.map_or(false, |g| g.is_valid_group_transaction(tx_id)),
        Ruleset::OwnedByGroup { .. } => {
            let (Some(group), Some(position)) = (group, group_at) else {
                return false;
            };
            group.covers(position)
                && group
                    .role_at(&tx_id.session.agent, position)
                    .map_or(false, |role| role.can_write())
        }
    }
}

/// Validity over one CoValue's transactions, fed session by session in
/// index order.
///
/// On top of [`is_transaction_valid`], a session's group positions may
/// never move backwards: each must cover every position the session
/// recorded before it.
#[derive(Debug)]
pub struct ValidityCheck<'a> {
    ruleset: &'a Ruleset,
    group: Option<&'a GroupState>,
    seen: HashMap<SessionId, SessionCounts>,
}

impl<'a> ValidityCheck<'a> {
    pub fn new(ruleset: &'a Ruleset, group: Option<&'a GroupState>) -> Self {
        Self {
            ruleset,
            group,
            seen: HashMap::new(),
        }
    }

    pub fn check(&mut self, tx_id: &TxId, group_at: Option<&SessionCounts>) -> bool {
        if !matches!(self.ruleset, Ruleset::OwnedByGroup { .. }) {
            return is_transaction_valid(self.ruleset, tx_id, group_at, self.group);
        }
        let Some(position) = group_at else {
            return false;
        };
        let seen = self.seen.entry(tx_id.session).or_default();
        let forward = sessions_cover(position, seen);
        combine_sessions(seen, position);
        forward && is_transaction_valid(self.ruleset, tx_id, group_at, self.group)
    }
}

/// Whether `agent` can currently read values under `ruleset`.
pub fn can_read(ruleset: &Ruleset, agent: &AgentId, group: Option<&GroupState>) -> bool {
    match ruleset {
        Ruleset::UnsafeAllowAll => true,
        Ruleset::Group { .. } | Ruleset::OwnedByGroup { .. } => group
            .and_then(|g| g.role(agent))
            .map_or(false, |role| role.can_read()),
    }
}

/// Whether `agent` can currently write values under `ruleset`.
pub fn can_write(ruleset: &Ruleset, agent: &AgentId, group: Option<&GroupState>) -> bool {
    match ruleset {
        Ruleset::UnsafeAllowAll => true,
        Ruleset::Group { .. } => group
            .and_then(|g| g.role(agent))
            .map_or(false, |role| role.can_admin()),
        Ruleset::OwnedByGroup { .. } => group
            .and_then(|g| g.role(agent))
            .map_or(false, |role| role.can_write()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::GroupOp;
    use crate::role::Role;
    use coval_core::{
        AgentSecret, CoValueHeader, CoValueId, CoValueType, DecryptedTransaction, KeyId,
        PrivacyKind,
    };

    fn session(agent: &AgentSecret) -> SessionId {
        SessionId {
            agent: agent.agent_id(),
            nonce: [1; 8],
        }
    }

    fn tx_id(agent: &AgentSecret, idx: u32) -> TxId {
        TxId {
            session: session(agent),
            idx,
        }
    }

    /// The admin writes `ops` one per transaction, each after seeing all
    /// earlier ones. Returns the group and the position after each op.
    fn group_with(admin: &AgentSecret, ops: Vec<GroupOp>) -> (GroupState, Vec<SessionCounts>) {
        let header = CoValueHeader::new_unique(
            CoValueType::Group,
            Ruleset::Group {
                initial_admin: admin.agent_id(),
            },
        );
        let at = |count: u32| SessionCounts::from([(session(admin), count)]);
        let txs: Vec<DecryptedTransaction> = ops
            .into_iter()
            .enumerate()
            .map(|(i, op)| DecryptedTransaction {
                tx_id: tx_id(admin, i as u32),
                made_at: 100 - i as u64,
                group_at: Some(at(i as u32)),
                privacy: PrivacyKind::Trusting,
                changes: vec![op.to_change()],
                meta: None,
            })
            .collect();
        let positions = (1..=txs.len() as u32).map(at).collect();
        (GroupState::replay(&header, &txs).unwrap(), positions)
    }

    fn owned() -> Ruleset {
        Ruleset::OwnedByGroup {
            group: CoValueId::from_bytes([0; 32]),
        }
    }

    #[test]
    fn test_validity_follows_role_history() {
        let admin = AgentSecret::generate();
        let writer = AgentSecret::generate();
        let (group, at) = group_with(
            &admin,
            vec![
                GroupOp::SetRole { agent: admin.agent_id(), role: Role::Admin },
                GroupOp::SetRole { agent: writer.agent_id(), role: Role::Writer },
                GroupOp::SetRole { agent: writer.agent_id(), role: Role::Reader },
            ],
        );
        let ruleset = owned();

        let id = tx_id(&writer, 0);
        assert!(!is_transaction_valid(&ruleset, &id, Some(&at[0]), Some(&group)));
        assert!(is_transaction_valid(&ruleset, &id, Some(&at[1]), Some(&group)));
        assert!(!is_transaction_valid(&ruleset, &id, Some(&at[2]), Some(&group)));
        assert!(!is_transaction_valid(&ruleset, &id, Some(&at[1]), None));
        assert!(!is_transaction_valid(&ruleset, &id, None, Some(&group)));

        assert!(can_read(&ruleset, &writer.agent_id(), Some(&group)));
        assert!(!can_write(&ruleset, &writer.agent_id(), Some(&group)));
    }

    #[test]
    fn test_position_beyond_group_is_not_yet_valid() {
        let admin = AgentSecret::generate();
        let (group, _) = group_with(
            &admin,
            vec![GroupOp::SetRole { agent: admin.agent_id(), role: Role::Admin }],
        );
        let ahead = SessionCounts::from([(session(&admin), 2)]);
        assert!(!is_transaction_valid(&owned(), &tx_id(&admin, 0), Some(&ahead), Some(&group)));
    }

    #[test]
    fn test_session_cannot_go_back_to_an_older_position() {
        let admin = AgentSecret::generate();
        let writer = AgentSecret::generate();
        let (group, at) = group_with(
            &admin,
            vec![
                GroupOp::SetRole { agent: admin.agent_id(), role: Role::Admin },
                GroupOp::SetRole { agent: writer.agent_id(), role: Role::Writer },
                GroupOp::SetReadKey { key_id: KeyId::generate() },
                GroupOp::SetRole { agent: writer.agent_id(), role: Role::Revoked },
            ],
        );
        let ruleset = owned();

        let mut check = ValidityCheck::new(&ruleset, Some(&group));
        assert!(check.check(&tx_id(&writer, 0), Some(&at[1])));
        assert!(check.check(&tx_id(&writer, 1), Some(&at[2])));
        // Revoked at the latest position; claiming an older one does not help.
        assert!(!check.check(&tx_id(&writer, 2), Some(&at[3])));
        assert!(!check.check(&tx_id(&writer, 3), Some(&at[1])));
        assert!(is_transaction_valid(&ruleset, &tx_id(&writer, 3), Some(&at[1]), Some(&group)));

        // A fresh session starts with no history.
        let mut fresh = ValidityCheck::new(&ruleset, Some(&group));
        assert!(fresh.check(&tx_id(&writer, 3), Some(&at[1])));
    }

    #[test]
    fn test_allow_all() {
        let agent = AgentSecret::generate();
        let ruleset = Ruleset::UnsafeAllowAll;
        assert!(is_transaction_valid(&ruleset, &tx_id(&agent, 0), None, None));
        assert!(ValidityCheck::new(&ruleset, None).check(&tx_id(&agent, 0), None));
        assert!(can_read(&ruleset, &agent.agent_id(), None));
    }
}
