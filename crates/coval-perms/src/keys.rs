//! Read key revelation via X25519 key agreement.
//!
//! When an admin gives an agent read access, the group's current read key is
//! sealed to that agent's sealer key and stored in the group under
//! `"<keyId>_for_<agentId>"`. When the read key is rotated, the previous key
//! is sealed under the new one (`"<oldKeyId>_for_<newKeyId>"`), so anyone
//! holding the newest key can walk back to every historical key.

use serde::{Deserialize, Serialize};

use coval_core::{
    AgentId, EncryptionKey, EphemeralKeyPair, KeyId, X25519PublicKey, X25519StaticSecret,
};

use crate::error::{PermsError, Result};

/// A read key sealed to one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyRevelation {
    /// Ephemeral X25519 public key (sender's side of ECDH).
    pub ephemeral_public: X25519PublicKey,

    /// The read key, encrypted with the derived shared secret (`nonce || ct`, hex).
    pub sealed: String,
}

impl KeyRevelation {
    /// Seal `key` to `recipient`.
    pub fn seal(key: &EncryptionKey, key_id: KeyId, recipient: &AgentId) -> Result<Self> {
        let ephemeral = EphemeralKeyPair::generate();
        let ephemeral_public = ephemeral.public_key();

        let shared = ephemeral.diffie_hellman(&recipient.sealer);
        let wrap_key = shared.derive_encryption_key(&context(key_id, &recipient.sealer));

        let sealed = wrap_key.seal_to_hex(key.as_bytes())?;
        Ok(Self {
            ephemeral_public,
            sealed,
        })
    }

    /// Open with the recipient's sealer secret.
    pub fn open(&self, key_id: KeyId, recipient_secret: &X25519StaticSecret) -> Result<EncryptionKey> {
        let shared = recipient_secret.diffie_hellman(&self.ephemeral_public);
        let wrap_key =
            shared.derive_encryption_key(&context(key_id, &recipient_secret.public_key()));
        key_from_bytes(&wrap_key.open_hex(&self.sealed)?)
    }
}

/// Seal an older read key under a newer one.
pub fn seal_previous_key(previous: &EncryptionKey, newer: &EncryptionKey) -> Result<String> {
    Ok(newer.seal_to_hex(previous.as_bytes())?)
}

/// Inverse of [`seal_previous_key`].
pub fn open_previous_key(sealed: &str, newer: &EncryptionKey) -> Result<EncryptionKey> {
    key_from_bytes(&newer.open_hex(sealed)?)
}

fn context(key_id: KeyId, recipient: &X25519PublicKey) -> Vec<u8> {
    let mut ctx = key_id.0.to_vec();
    ctx.extend_from_slice(recipient.as_bytes());
    ctx
}

fn key_from_bytes(bytes: &[u8]) -> Result<EncryptionKey> {
    let arr: [u8; 32] = bytes.try_into().map_err(|_| {
        PermsError::DecryptionError(format!(
            "invalid key length: expected 32, got {}",
            bytes.len()
        ))
    })?;
    Ok(EncryptionKey::from_bytes(arr))
}
