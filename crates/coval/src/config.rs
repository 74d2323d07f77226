//! Node configuration.

use std::time::Duration;

use coval_core::DEFAULT_CHECKPOINT_BYTES;
use coval_sync::SyncConfig;

/// Configuration for a [`LocalNode`](crate::LocalNode).
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Bytes of transactions after which a session records a signature
    /// checkpoint. Checkpoints are also content chunk boundaries.
    pub signature_checkpoint_bytes: usize,
    /// Queue-level sync settings.
    pub sync: SyncConfig,
    /// How long a load waits for peers before giving up.
    pub load_timeout: Duration,
    /// Append content from storage peers without re-checking signatures.
    ///
    /// Signatures are still checked before such content is forwarded to a
    /// non-storage peer.
    pub trust_storage_signatures: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            signature_checkpoint_bytes: DEFAULT_CHECKPOINT_BYTES,
            sync: SyncConfig::default(),
            load_timeout: Duration::from_secs(30),
            trust_storage_signatures: true,
        }
    }
}
