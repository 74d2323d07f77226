//! Proptest generators for property-based testing.

use std::collections::BTreeMap;

use proptest::prelude::*;
use serde_json::{json, Value};

use coval_core::{
    AgentSecret, CoValueHeader, CoValueType, Privacy, Ruleset, SessionId, VerifiedState,
};

/// Generate a deterministic agent.
pub fn agent_secret() -> impl Strategy<Value = AgentSecret> {
    any::<[u8; 32]>().prop_map(|seed| AgentSecret::from_seed(&seed))
}

/// Generate a map key from a small alphabet, so ops collide often.
pub fn map_key() -> impl Strategy<Value = String> {
    "[a-d]".prop_map(String::from)
}

/// Generate a scalar JSON value.
pub fn json_scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::from),
        "[a-z0-9 ]{0,16}".prop_map(Value::from),
    ]
}

/// One write to a map.
#[derive(Debug, Clone, PartialEq)]
pub enum MapOp {
    Set(String, Value),
    Delete(String),
}

impl MapOp {
    /// The change this op is written as.
    pub fn to_change(&self) -> Value {
        match self {
            MapOp::Set(key, value) => json!({ "op": "set", "key": key, "value": value }),
            MapOp::Delete(key) => json!({ "op": "del", "key": key }),
        }
    }
}

/// Generate a map op.
pub fn map_op() -> impl Strategy<Value = MapOp> {
    prop_oneof![
        3 => (map_key(), json_scalar()).prop_map(|(k, v)| MapOp::Set(k, v)),
        1 => map_key().prop_map(MapOp::Delete),
    ]
}

/// Generate up to `max` map ops.
pub fn map_ops(max: usize) -> impl Strategy<Value = Vec<MapOp>> {
    prop::collection::vec(map_op(), 0..=max)
}

/// Expected contents after applying `ops` in order.
pub fn apply_map_ops(ops: &[MapOp]) -> BTreeMap<String, Value> {
    let mut map = BTreeMap::new();
    for op in ops {
        match op {
            MapOp::Set(key, value) => {
                map.insert(key.clone(), value.clone());
            }
            MapOp::Delete(key) => {
                map.remove(key);
            }
        }
    }
    map
}

/// Generate non-empty change batches, one per transaction.
pub fn change_batches(
    max_batches: usize,
    max_changes: usize,
) -> impl Strategy<Value = Vec<Vec<Value>>> {
    prop::collection::vec(
        prop::collection::vec(map_op().prop_map(|op| op.to_change()), 1..=max_changes),
        1..=max_batches,
    )
}

/// Parameters for a signed single-session CoValue.
#[derive(Debug, Clone)]
pub struct TransactionBatches {
    pub seed: [u8; 32],
    pub batches: Vec<Vec<Value>>,
}

impl TransactionBatches {
    /// Sign the batches into a fresh unowned CoValue, one trusting
    /// transaction per batch. Returns the state and the writing session.
    pub fn build(&self, checkpoint_bytes: usize) -> (VerifiedState, SessionId) {
        let agent = AgentSecret::from_seed(&self.seed);
        let session = SessionId::new_random(agent.agent_id());
        let header = CoValueHeader::new_unique(CoValueType::CoMap, Ruleset::UnsafeAllowAll);
        let mut state = VerifiedState::with_checkpoint_bytes(header, checkpoint_bytes);
        for (made_at, changes) in self.batches.iter().enumerate() {
            state
                .add_new_transaction(
                    session,
                    changes,
                    None,
                    Privacy::Trusting,
                    &agent.signer,
                    made_at as u64,
                )
                .expect("trusting transactions always sign");
        }
        (state, session)
    }
}

impl Arbitrary for TransactionBatches {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: ()) -> Self::Strategy {
        (any::<[u8; 32]>(), change_batches(8, 4))
            .prop_map(|(seed, batches)| TransactionBatches { seed, batches })
            .boxed()
    }
}
