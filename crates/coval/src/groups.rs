//! Groups: membership and read keys.
//!
//! Group changes are ordinary trusting transactions on the group CoValue,
//! written as map ops by [`GroupOp`]. Read keys are revealed to each member
//! sealed to their agent; rotating the key seals the previous key under the
//! new one, so history stays readable to anyone holding the newest key.

use coval_core::{
    AgentId, CoValueHeader, CoValueId, CoValueType, EncryptionKey, KeyId, PrivacyKind, Ruleset,
};
use coval_perms::{seal_previous_key, GroupOp, GroupState, KeyRevelation, Role};
use tracing::debug;

use crate::error::{NodeError, Result};
use crate::node::LocalNode;

impl LocalNode {
    /// Create a group with this node's agent as admin and a fresh read key.
    pub fn create_group(&self) -> Result<CoValueId> {
        let me = self.agent_id();
        let header = CoValueHeader::new_unique(
            CoValueType::Group,
            Ruleset::Group { initial_admin: me },
        );

        let mut state = self.lock();
        let id = state.create_co_value(header)?;
        let key_id = KeyId::generate();
        let key = EncryptionKey::generate();
        let ops = [
            GroupOp::SetRole {
                agent: me,
                role: Role::Admin,
            },
            GroupOp::SetReadKey { key_id },
            GroupOp::RevealKey {
                key_id,
                to: me,
                revelation: KeyRevelation::seal(&key, key_id, &me)?,
            },
        ];
        let changes: Vec<_> = ops.iter().map(GroupOp::to_change).collect();
        state.make_transaction(&id, &changes, PrivacyKind::Trusting, None)?;
        debug!(group = %id, "group created");
        Ok(id)
    }

    /// Replayed state of `group`.
    pub fn group_state(&self, group: CoValueId) -> Result<GroupState> {
        self.lock().group_state(&group)
    }

    /// Give `agent` a role in `group`. Readers also get the current read key.
    pub fn add_member(&self, group: CoValueId, agent: AgentId, role: Role) -> Result<()> {
        let mut state = self.lock();
        let group_state = state.group_state(&group)?;

        let mut ops = vec![GroupOp::SetRole { agent, role }];
        if role.can_read() {
            let (key_id, key) = group_state.current_read_key(&state.agent)?;
            ops.push(GroupOp::RevealKey {
                key_id,
                to: agent,
                revelation: KeyRevelation::seal(&key, key_id, &agent)?,
            });
        }
        let changes: Vec<_> = ops.iter().map(GroupOp::to_change).collect();
        state.make_transaction(&group, &changes, PrivacyKind::Trusting, None)?;
        debug!(%group, %agent, role = role.as_str(), "member set");
        Ok(())
    }

    /// Replace the read key of `group`. Returns the new key id.
    ///
    /// The new key is revealed to every member that can read; the previous
    /// key is sealed under the new one.
    pub fn rotate_read_key(&self, group: CoValueId) -> Result<KeyId> {
        let mut state = self.lock();
        let group_state = state.group_state(&group)?;
        let (old_id, old_key) = group_state.current_read_key(&state.agent)?;
        if !group_state
            .role(&state.agent.agent_id())
            .map_or(false, |role| role.can_admin())
        {
            return Err(NodeError::NotAuthorized(format!(
                "only admins rotate the read key of {group}"
            )));
        }

        let key_id = KeyId::generate();
        let key = EncryptionKey::generate();
        let mut ops = vec![
            GroupOp::SetReadKey { key_id },
            GroupOp::ChainKey {
                key_id: old_id,
                under: key_id,
                sealed: seal_previous_key(&old_key, &key)?,
            },
        ];
        for (member, role) in group_state.members() {
            if role.can_read() {
                ops.push(GroupOp::RevealKey {
                    key_id,
                    to: member,
                    revelation: KeyRevelation::seal(&key, key_id, &member)?,
                });
            }
        }
        let changes: Vec<_> = ops.iter().map(GroupOp::to_change).collect();
        state.make_transaction(&group, &changes, PrivacyKind::Trusting, None)?;
        debug!(%group, old = %old_id, new = %key_id, "read key rotated");
        Ok(key_id)
    }
}
