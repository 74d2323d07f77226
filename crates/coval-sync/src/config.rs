//! Queue-level sync settings.

use std::time::Duration;

/// Configuration for sync behavior.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// How long incoming messages are processed before yielding.
    pub incoming_budget: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            incoming_budget: Duration::from_millis(50),
        }
    }
}
