//! Strong identifier types.
//!
//! All identifiers are newtypes with a prefixed string form, so they can be
//! used as JSON map keys and stored as text.

use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::cipher::{X25519PublicKey, X25519StaticSecret};
use crate::crypto::{prefixed_string_form, Blake3Hash, Ed25519PublicKey, Keypair};
use crate::error::CoreError;

/// A 32-byte CoValue identifier: the Blake3 hash of its canonical header.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoValueId(pub [u8; 32]);

impl CoValueId {
    /// Create a new id from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

prefixed_string_form!(CoValueId, 32, "co_z");

impl fmt::Debug for CoValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CoValueId({})", &self.to_hex()[..16])
    }
}

impl From<Blake3Hash> for CoValueId {
    fn from(hash: Blake3Hash) -> Self {
        Self(hash.0)
    }
}

/// Identifies a group read key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId(pub [u8; 16]);

impl KeyId {
    /// Generate a fresh random key id.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }
}

prefixed_string_form!(KeyId, 16, "key_z");

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyId({})", hex::encode(self.0))
    }
}

/// Public identity of an agent: a signer key and a sealer key.
///
/// String form: `agent_z<signer-hex><sealer-hex>`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AgentId {
    pub signer: Ed25519PublicKey,
    pub sealer: X25519PublicKey,
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "agent_z{}{}",
            hex::encode(self.signer.0),
            hex::encode(self.sealer.0)
        )
    }
}

impl fmt::Debug for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AgentId({})", &hex::encode(self.signer.0)[..16])
    }
}

impl FromStr for AgentId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let both: [u8; 64] = crate::crypto::decode_prefixed(s, "agent_z")?;
        let mut signer = [0u8; 32];
        let mut sealer = [0u8; 32];
        signer.copy_from_slice(&both[..32]);
        sealer.copy_from_slice(&both[32..]);
        Ok(Self {
            signer: Ed25519PublicKey(signer),
            sealer: X25519PublicKey(sealer),
        })
    }
}

impl Serialize for AgentId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for AgentId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Secret material of an agent.
#[derive(Clone, Debug)]
pub struct AgentSecret {
    pub signer: Keypair,
    pub sealer: X25519StaticSecret,
}

impl AgentSecret {
    /// Generate a fresh random agent.
    pub fn generate() -> Self {
        Self {
            signer: Keypair::generate(),
            sealer: X25519StaticSecret::generate(),
        }
    }

    /// Deterministic agent from a seed (signer and sealer derived separately).
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let sealer_seed = blake3::derive_key("coval-agent-v0-sealer", seed);
        Self {
            signer: Keypair::from_seed(seed),
            sealer: X25519StaticSecret::from_bytes(sealer_seed),
        }
    }

    /// The public identity.
    pub fn agent_id(&self) -> AgentId {
        AgentId {
            signer: self.signer.public_key(),
            sealer: self.sealer.public_key(),
        }
    }
}

/// One causal, strictly ordered append log written by one agent-session.
///
/// String form: `<agent>_session_z<nonce-hex>`. The derived ordering equals
/// the ordering of the string forms.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId {
    pub agent: AgentId,
    pub nonce: [u8; 8],
}

impl SessionId {
    /// Start a new session for `agent`.
    pub fn new_random(agent: AgentId) -> Self {
        let mut nonce = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut nonce);
        Self { agent, nonce }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_session_z{}", self.agent, hex::encode(self.nonce))
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SessionId({}/{})",
            &hex::encode(self.agent.signer.0)[..8],
            hex::encode(self.nonce)
        )
    }
}

impl FromStr for SessionId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (agent, nonce) = s
            .split_once("_session_")
            .ok_or_else(|| CoreError::DecodingError(format!("not a session id: {s}")))?;
        Ok(Self {
            agent: agent.parse()?,
            nonce: crate::crypto::decode_prefixed(nonce, "z")?,
        })
    }
}

impl Serialize for SessionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SessionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_session_id_string_roundtrip() {
        let agent = AgentSecret::from_seed(&[3; 32]).agent_id();
        let session = SessionId::new_random(agent);
        let s = session.to_string();
        assert!(s.starts_with("agent_z"));
        assert!(s.contains("_session_z"));
        assert_eq!(s.parse::<SessionId>().unwrap(), session);
    }

    #[test]
    fn test_agent_from_seed_deterministic() {
        let a = AgentSecret::from_seed(&[9; 32]).agent_id();
        let b = AgentSecret::from_seed(&[9; 32]).agent_id();
        assert_eq!(a, b);
        assert_ne!(a, AgentSecret::from_seed(&[8; 32]).agent_id());
    }

    #[test]
    fn test_session_ids_as_json_map_keys() {
        let agent = AgentSecret::generate().agent_id();
        let mut sessions = BTreeMap::new();
        sessions.insert(SessionId::new_random(agent), 3u32);
        let json = serde_json::to_string(&sessions).unwrap();
        let back: BTreeMap<SessionId, u32> = serde_json::from_str(&json).unwrap();
        assert_eq!(sessions, back);
    }

    #[test]
    fn test_session_order_matches_string_order() {
        let agent = AgentSecret::from_seed(&[1; 32]).agent_id();
        let a = SessionId { agent, nonce: [0, 0, 0, 0, 0, 0, 0, 1] };
        let b = SessionId { agent, nonce: [0, 0, 0, 0, 0, 0, 1, 0] };
        assert!(a < b);
        assert!(a.to_string() < b.to_string());
    }

    #[test]
    fn test_co_value_id_display() {
        let id = CoValueId::from_bytes([0xab; 32]);
        assert!(id.to_string().starts_with("co_zabab"));
        assert_eq!(id.to_string().parse::<CoValueId>().unwrap(), id);
    }
}
