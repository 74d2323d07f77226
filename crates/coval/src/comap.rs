//! Raw map view over a CoValue.
//!
//! A map is a replay of `set`/`del` ops in transaction order; the last op
//! for a key wins. Nothing is cached: every read replays the currently
//! valid transactions, so the view always agrees with permissions and
//! merged branches.

use serde_json::{json, Map, Value};
use tracing::trace;

use coval_core::{CoValueId, KnownState, PrivacyKind};

use crate::error::Result;
use crate::node::LocalNode;
use crate::refs::CoValueRef;
use crate::state::ValidTransactionsOptions;

/// A map view of one CoValue on a node.
#[derive(Clone)]
pub struct RawCoMap {
    node: LocalNode,
    id: CoValueId,
}

impl RawCoMap {
    pub(crate) fn new(node: LocalNode, id: CoValueId) -> Self {
        Self { node, id }
    }

    pub fn id(&self) -> CoValueId {
        self.id
    }

    /// Set `key`, encrypted when the owner group gives us a read key.
    pub fn set(&self, key: &str, value: Value) -> Result<KnownState> {
        let privacy = self.node.default_privacy(self.id)?;
        self.set_with_privacy(key, value, privacy)
    }

    pub fn set_with_privacy(
        &self,
        key: &str,
        value: Value,
        privacy: PrivacyKind,
    ) -> Result<KnownState> {
        let op = json!({ "op": "set", "key": key, "value": value });
        self.node.make_transaction(self.id, vec![op], privacy, None)
    }

    pub fn delete(&self, key: &str) -> Result<KnownState> {
        let privacy = self.node.default_privacy(self.id)?;
        let op = json!({ "op": "del", "key": key });
        self.node.make_transaction(self.id, vec![op], privacy, None)
    }

    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.as_object()?.remove(key))
    }

    /// The current contents.
    pub fn as_object(&self) -> Result<Map<String, Value>> {
        let transactions = self
            .node
            .get_valid_transactions(self.id, &ValidTransactionsOptions::default())?;

        let mut map = Map::new();
        for tx in &transactions {
            for change in &tx.changes {
                apply_op(&mut map, change);
            }
        }
        Ok(map)
    }

    /// The value at `key` as a reference, if it holds a CoValue id.
    pub fn get_ref(&self, key: &str) -> Result<Option<CoValueRef>> {
        let Some(Value::String(raw)) = self.get(key)? else {
            return Ok(None);
        };
        Ok(raw
            .parse::<CoValueId>()
            .ok()
            .map(|id| self.node.reference(id)))
    }
}

fn apply_op(map: &mut Map<String, Value>, change: &Value) {
    let key = change.get("key").and_then(Value::as_str);
    match (change.get("op").and_then(Value::as_str), key) {
        (Some("set"), Some(key)) => {
            let value = change.get("value").cloned().unwrap_or(Value::Null);
            map.insert(key.to_owned(), value);
        }
        (Some("del"), Some(key)) => {
            map.remove(key);
        }
        _ => trace!(?change, "ignoring non-map change"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use coval_core::AgentSecret;

    fn node() -> LocalNode {
        LocalNode::new(AgentSecret::generate(), NodeConfig::default())
    }

    #[test]
    fn ops_replay_in_order() {
        let mut map = Map::new();
        apply_op(&mut map, &json!({"op": "set", "key": "a", "value": 1}));
        apply_op(&mut map, &json!({"op": "set", "key": "b", "value": 2}));
        apply_op(&mut map, &json!({"op": "del", "key": "a"}));
        apply_op(&mut map, &json!({"op": "set", "key": "b", "value": 3}));
        apply_op(&mut map, &json!({"unrelated": true}));

        assert_eq!(Value::Object(map), json!({"b": 3}));
    }

    #[tokio::test]
    async fn set_get_delete() {
        let node = node();
        let group = node.create_group().unwrap();
        let map = node.create_map(group).unwrap();

        map.set("hello", json!("world")).unwrap();
        map.set("n", json!(1)).unwrap();
        assert_eq!(map.get("hello").unwrap(), Some(json!("world")));

        map.delete("hello").unwrap();
        assert_eq!(map.get("hello").unwrap(), None);
        assert_eq!(Value::Object(map.as_object().unwrap()), json!({"n": 1}));
    }

    #[tokio::test]
    async fn writes_are_private_when_the_group_has_a_key() {
        let node = node();
        let group = node.create_group().unwrap();
        let map = node.create_map(group).unwrap();
        map.set("secret", json!(42)).unwrap();

        let txs = node
            .get_valid_transactions(map.id(), &ValidTransactionsOptions::default())
            .unwrap();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].privacy, PrivacyKind::Private);

        let opts = ValidTransactionsOptions {
            ignore_private_transactions: true,
            ..Default::default()
        };
        assert!(node.get_valid_transactions(map.id(), &opts).unwrap().is_empty());
    }

    #[tokio::test]
    async fn references_parse_co_value_ids() {
        let node = node();
        let group = node.create_group().unwrap();
        let map = node.create_map(group).unwrap();

        map.set("owner", json!(group.to_string())).unwrap();
        map.set("name", json!("not an id")).unwrap();

        assert_eq!(map.get_ref("owner").unwrap().map(|r| r.id()), Some(group));
        assert!(map.get_ref("name").unwrap().is_none());
        assert!(map.get_ref("missing").unwrap().is_none());
    }
}
