//! Explicit references between CoValues.
//!
//! A reference is only an id plus the node to look it up on. Nothing is
//! loaded until [`CoValueRef::resolve`] is called.

use coval_core::{CoValueId, CoValueType};
use coval_perms::GroupState;

use crate::co_value_core::LoadOutcome;
use crate::comap::RawCoMap;
use crate::error::Result;
use crate::node::LocalNode;

/// What a resolved reference points at.
pub enum CoValueContent {
    Map(RawCoMap),
    Group(GroupState),
    /// A type without a view on this node yet.
    Other { id: CoValueId, co_type: CoValueType },
}

#[derive(Clone)]
pub struct CoValueRef {
    node: LocalNode,
    id: CoValueId,
}

impl CoValueRef {
    pub(crate) fn new(node: LocalNode, id: CoValueId) -> Self {
        Self { node, id }
    }

    pub fn id(&self) -> CoValueId {
        self.id
    }

    /// Load the target and view it by its type.
    ///
    /// Returns `None` when the value is unavailable or not readable by us.
    pub async fn resolve(&self) -> Result<Option<CoValueContent>> {
        match self.node.load(self.id).await? {
            LoadOutcome::Available => self.node.content(self.id).map(Some),
            LoadOutcome::Unavailable | LoadOutcome::Unauthorized => Ok(None),
        }
    }
}

impl std::fmt::Debug for CoValueRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("CoValueRef").field(&self.id).finish()
    }
}

impl LocalNode {
    /// A typed view of a loaded value.
    pub fn content(&self, id: CoValueId) -> Result<CoValueContent> {
        let co_type = self.lock().header(&id)?.co_type;
        Ok(match co_type {
            CoValueType::CoMap => CoValueContent::Map(RawCoMap::new(self.clone(), id)),
            CoValueType::Group => CoValueContent::Group(self.group_state(id)?),
            co_type => CoValueContent::Other { id, co_type },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use coval_core::{AgentSecret, CoValueHeader, Ruleset};
    use serde_json::json;

    #[tokio::test]
    async fn resolves_by_type() {
        let node = LocalNode::new(AgentSecret::generate(), NodeConfig::default());
        let group = node.create_group().unwrap();
        let map = node.create_map(group).unwrap();
        map.set("k", json!("v")).unwrap();
        let list = node
            .create_co_value(CoValueHeader::new_unique(
                CoValueType::CoList,
                Ruleset::UnsafeAllowAll,
            ))
            .unwrap();

        match node.reference(map.id()).resolve().await.unwrap() {
            Some(CoValueContent::Map(view)) => {
                assert_eq!(view.get("k").unwrap(), Some(json!("v")))
            }
            _ => panic!("expected a map"),
        }
        match node.reference(group).resolve().await.unwrap() {
            Some(CoValueContent::Group(state)) => {
                assert_eq!(state.members().len(), 1)
            }
            _ => panic!("expected a group"),
        }
        assert!(matches!(
            node.reference(list).resolve().await.unwrap(),
            Some(CoValueContent::Other { co_type: CoValueType::CoList, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_reference_resolves_to_none() {
        let node = LocalNode::new(AgentSecret::generate(), NodeConfig::default());
        let missing = CoValueHeader::new_unique(CoValueType::CoMap, Ruleset::UnsafeAllowAll).id();
        assert!(node.reference(missing).resolve().await.unwrap().is_none());
    }
}
