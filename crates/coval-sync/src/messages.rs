//! Sync protocol message types.
//!
//! Peers exchange these to converge on the same content for each CoValue.
//! All of them are JSON objects tagged by `action`.

use serde::{Deserialize, Serialize};

use coval_core::{CoValueId, KnownState, NewContentMessage};

use crate::error::SyncError;

/// A `known` announcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnownMessage {
    #[serde(flatten)]
    pub known: KnownState,

    /// Replace, rather than combine with, what the receiver believes we know.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_correction: bool,
}

/// Sync protocol messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum SyncMessage {
    /// Ask for content, announcing what we already have.
    Load(KnownState),

    /// Announce what we have; answered with content if the receiver has more.
    Known(KnownMessage),

    /// New header and/or transactions.
    Content(NewContentMessage),

    /// The sender is done with this CoValue.
    Done { id: CoValueId },
}

impl SyncMessage {
    /// A plain `known` announcement.
    pub fn known(known: KnownState) -> Self {
        Self::Known(KnownMessage {
            known,
            is_correction: false,
        })
    }

    /// A `known` that replaces the receiver's view of us.
    pub fn correction(known: KnownState) -> Self {
        Self::Known(KnownMessage {
            known,
            is_correction: true,
        })
    }

    /// The CoValue this message is about.
    pub fn id(&self) -> CoValueId {
        match self {
            Self::Load(known) => known.id,
            Self::Known(msg) => msg.known.id,
            Self::Content(content) => content.id,
            Self::Done { id } => *id,
        }
    }

    /// Encode for a byte-oriented transport.
    pub fn to_json(&self) -> Result<String, SyncError> {
        serde_json::to_string(self).map_err(|e| SyncError::InvalidMessage(e.to_string()))
    }

    /// Decode a message received from a byte-oriented transport.
    pub fn from_json(s: &str) -> Result<Self, SyncError> {
        serde_json::from_str(s).map_err(|e| SyncError::InvalidMessage(e.to_string()))
    }

    /// Short name for logs.
    pub fn action(&self) -> &'static str {
        match self {
            Self::Load(_) => "load",
            Self::Known(_) => "known",
            Self::Content(_) => "content",
            Self::Done { .. } => "done",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coval_core::{AgentSecret, SessionId};
    use serde_json::json;

    fn known() -> KnownState {
        let session = SessionId::new_random(AgentSecret::from_seed(&[1; 32]).agent_id());
        KnownState {
            id: CoValueId::from_bytes([5; 32]),
            header: true,
            sessions: [(session, 3)].into_iter().collect(),
        }
    }

    #[test]
    fn test_load_wire_shape() {
        let msg = SyncMessage::Load(known());
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["action"], "load");
        assert_eq!(value["header"], true);
        assert!(value["id"].as_str().unwrap().starts_with("co_z"));
        assert_eq!(value["sessions"].as_object().unwrap().len(), 1);
        assert_eq!(serde_json::from_value::<SyncMessage>(value).unwrap(), msg);
    }

    #[test]
    fn test_known_correction_flag() {
        let plain = serde_json::to_value(SyncMessage::known(known())).unwrap();
        assert_eq!(plain["action"], "known");
        assert!(plain.get("isCorrection").is_none());

        let correction = serde_json::to_value(SyncMessage::correction(known())).unwrap();
        assert_eq!(correction["isCorrection"], true);
        let parsed: SyncMessage = serde_json::from_value(correction).unwrap();
        assert!(matches!(parsed, SyncMessage::Known(KnownMessage { is_correction: true, .. })));
    }

    #[test]
    fn test_content_without_header() {
        let id = CoValueId::from_bytes([6; 32]);
        let value = json!({"action": "content", "id": id.to_string(), "new": {}});
        let parsed: SyncMessage = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.id(), id);
        assert_eq!(parsed.action(), "content");
        let SyncMessage::Content(content) = parsed else {
            panic!("expected content");
        };
        assert!(content.header.is_none());
        assert!(content.expect_content_until.is_none());
    }

    #[test]
    fn test_json_text_roundtrip_and_garbage() {
        let msg = SyncMessage::correction(known());
        assert_eq!(SyncMessage::from_json(&msg.to_json().unwrap()).unwrap(), msg);
        assert!(matches!(
            SyncMessage::from_json(r#"{"action":"shout"}"#),
            Err(SyncError::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_done() {
        let id = CoValueId::from_bytes([7; 32]);
        let msg: SyncMessage =
            serde_json::from_value(json!({"action": "done", "id": id.to_string()})).unwrap();
        assert_eq!(msg, SyncMessage::Done { id });
    }
}
