//! CoValue headers.
//!
//! A header is created once and never mutated. Its canonical bytes hash to
//! the CoValue's id, so anyone holding the header can check that it belongs
//! to the id it was sent under.

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::canonical::canonical_header_bytes;
use crate::crypto::Blake3Hash;
use crate::ids::{AgentId, CoValueId};

/// The shape of a CoValue's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoValueType {
    CoMap,
    CoList,
    CoStream,
    Group,
}

impl CoValueType {
    /// Wire name of the type.
    pub fn as_str(&self) -> &'static str {
        match self {
            CoValueType::CoMap => "comap",
            CoValueType::CoList => "colist",
            CoValueType::CoStream => "costream",
            CoValueType::Group => "group",
        }
    }
}

/// Ownership rule of a CoValue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Ruleset {
    /// A self-owned group, bootstrapped by its initial admin.
    #[serde(rename_all = "camelCase")]
    Group { initial_admin: AgentId },

    /// Permissions are resolved through the owning group.
    OwnedByGroup { group: CoValueId },

    /// Anyone may read and write. Used by tests and public scratch values.
    UnsafeAllowAll,
}

/// Branch metadata carried by a header.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct HeaderMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<CoValueId>,
}

/// The immutable header of a CoValue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CoValueHeader {
    #[serde(rename = "type")]
    pub co_type: CoValueType,
    pub ruleset: Ruleset,
    #[serde(default)]
    pub meta: Option<HeaderMeta>,
    #[serde(default)]
    pub uniqueness: Option<String>,
}

impl CoValueHeader {
    /// A header with a fresh random uniqueness salt.
    pub fn new_unique(co_type: CoValueType, ruleset: Ruleset) -> Self {
        let mut salt = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut salt);
        Self {
            co_type,
            ruleset,
            meta: None,
            uniqueness: Some(hex::encode(salt)),
        }
    }

    /// The header of the branch `name` of `source`, owned by `owner`.
    ///
    /// Carries no uniqueness, so every peer deriving the same branch gets
    /// the same id.
    pub fn branch(co_type: CoValueType, name: &str, owner: CoValueId, source: CoValueId) -> Self {
        Self {
            co_type,
            ruleset: Ruleset::OwnedByGroup { group: owner },
            meta: Some(HeaderMeta {
                branch: Some(name.to_string()),
                source: Some(source),
            }),
            uniqueness: None,
        }
    }

    /// The id this header hashes to.
    pub fn id(&self) -> CoValueId {
        Blake3Hash::hash(&canonical_header_bytes(self)).into()
    }

    /// The group that owns this value, if any.
    pub fn owner(&self) -> Option<CoValueId> {
        match &self.ruleset {
            Ruleset::OwnedByGroup { group } => Some(*group),
            _ => None,
        }
    }

    /// The source this header branches from.
    pub fn branch_source(&self) -> Option<CoValueId> {
        self.meta.as_ref().and_then(|m| m.source)
    }

    /// The branch name, if this is a branch header.
    pub fn branch_name(&self) -> Option<&str> {
        self.meta.as_ref().and_then(|m| m.branch.as_deref())
    }

    /// CoValues that must be known before this one can be validated.
    pub fn dependencies(&self) -> Vec<CoValueId> {
        let mut deps = Vec::new();
        if let Some(owner) = self.owner() {
            deps.push(owner);
        }
        if let Some(source) = self.branch_source() {
            if !deps.contains(&source) {
                deps.push(source);
            }
        }
        deps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::AgentSecret;

    #[test]
    fn test_unique_headers_differ() {
        let a = CoValueHeader::new_unique(CoValueType::CoMap, Ruleset::UnsafeAllowAll);
        let b = CoValueHeader::new_unique(CoValueType::CoMap, Ruleset::UnsafeAllowAll);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_branch_header_deterministic() {
        let owner = CoValueId::from_bytes([1; 32]);
        let source = CoValueId::from_bytes([2; 32]);
        let a = CoValueHeader::branch(CoValueType::CoMap, "feature", owner, source);
        let b = CoValueHeader::branch(CoValueType::CoMap, "feature", owner, source);
        assert_eq!(a.id(), b.id());

        let other = CoValueHeader::branch(CoValueType::CoMap, "other", owner, source);
        assert_ne!(a.id(), other.id());
    }

    #[test]
    fn test_dependencies() {
        let owner = CoValueId::from_bytes([1; 32]);
        let source = CoValueId::from_bytes([2; 32]);
        let branch = CoValueHeader::branch(CoValueType::CoMap, "x", owner, source);
        assert_eq!(branch.dependencies(), vec![owner, source]);

        let admin = AgentSecret::from_seed(&[5; 32]).agent_id();
        let group = CoValueHeader::new_unique(
            CoValueType::Group,
            Ruleset::Group { initial_admin: admin },
        );
        assert!(group.dependencies().is_empty());
    }

    #[test]
    fn test_header_json_shape() {
        let header = CoValueHeader::branch(
            CoValueType::CoMap,
            "feature",
            CoValueId::from_bytes([1; 32]),
            CoValueId::from_bytes([2; 32]),
        );
        let json = serde_json::to_value(&header).unwrap();
        assert_eq!(json["type"], "comap");
        assert_eq!(json["ruleset"]["type"], "ownedByGroup");
        assert_eq!(json["meta"]["branch"], "feature");

        let back: CoValueHeader = serde_json::from_value(json).unwrap();
        assert_eq!(back.id(), header.id());
    }
}
