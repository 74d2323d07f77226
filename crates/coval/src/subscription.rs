//! Change subscriptions.
//!
//! Subscriptions live in a registry keyed by CoValue id. A [`Subscription`]
//! only holds a weak handle to the node, so it never keeps the node alive;
//! it is removed by [`Subscription::unsubscribe`], or dropped from the
//! registry the next time delivery to it fails.

use std::collections::HashMap;
use std::sync::Weak;

use tokio::sync::mpsc;
use tracing::trace;

use coval_core::{CoValueId, KnownState};

use crate::node::NodeInner;

#[derive(Debug, Default)]
pub(crate) struct SubscriptionRegistry {
    next_key: u64,
    by_id: HashMap<CoValueId, HashMap<u64, mpsc::UnboundedSender<KnownState>>>,
}

impl SubscriptionRegistry {
    /// Register a subscriber of `id`. `current` is delivered to it alone.
    pub(crate) fn add(
        &mut self,
        id: CoValueId,
        current: Option<&KnownState>,
    ) -> (u64, mpsc::UnboundedReceiver<KnownState>) {
        let key = self.next_key;
        self.next_key += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(known) = current {
            // The receiver is still in hand, so this cannot fail.
            let _ = tx.send(known.clone());
        }
        self.by_id.entry(id).or_default().insert(key, tx);
        (key, rx)
    }

    pub(crate) fn remove(&mut self, id: &CoValueId, key: u64) {
        if let Some(subs) = self.by_id.get_mut(id) {
            subs.remove(&key);
            if subs.is_empty() {
                self.by_id.remove(id);
            }
        }
    }

    /// Deliver `known` to every subscriber of its id.
    pub(crate) fn notify(&mut self, known: &KnownState) {
        let Some(subs) = self.by_id.get_mut(&known.id) else {
            return;
        };
        subs.retain(|key, tx| {
            let alive = tx.send(known.clone()).is_ok();
            if !alive {
                trace!(id = %known.id, key, "dropping closed subscription");
            }
            alive
        });
        if subs.is_empty() {
            self.by_id.remove(&known.id);
        }
    }

    pub(crate) fn count(&self, id: &CoValueId) -> usize {
        self.by_id.get(id).map_or(0, HashMap::len)
    }
}

/// A live subscription to one CoValue.
///
/// Yields the verified known state once on subscribe (if the value is
/// loaded) and again after every change.
#[derive(Debug)]
pub struct Subscription {
    id: CoValueId,
    key: u64,
    receiver: mpsc::UnboundedReceiver<KnownState>,
    node: Weak<NodeInner>,
}

impl Subscription {
    pub(crate) fn new(
        id: CoValueId,
        key: u64,
        receiver: mpsc::UnboundedReceiver<KnownState>,
        node: Weak<NodeInner>,
    ) -> Self {
        Self {
            id,
            key,
            receiver,
            node,
        }
    }

    pub fn id(&self) -> CoValueId {
        self.id
    }

    /// Wait for the next change. `None` once unsubscribed or the node is gone.
    pub async fn recv(&mut self) -> Option<KnownState> {
        self.receiver.recv().await
    }

    /// The next change, if one is already queued.
    pub fn try_recv(&mut self) -> Option<KnownState> {
        self.receiver.try_recv().ok()
    }

    /// Remove the subscription from the node's registry.
    pub fn unsubscribe(self) {
        if let Some(node) = self.node.upgrade() {
            node.lock().subscriptions.remove(&self.id, self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn known(id: CoValueId) -> KnownState {
        let mut known = KnownState::empty(id);
        known.header = true;
        known
    }

    #[test]
    fn test_current_state_goes_to_new_subscriber_only() {
        let id = CoValueId::from_bytes([1; 32]);
        let mut registry = SubscriptionRegistry::default();

        let (_, mut first) = registry.add(id, Some(&known(id)));
        assert_eq!(first.try_recv().ok(), Some(known(id)));

        let (_, mut second) = registry.add(id, Some(&known(id)));
        assert_eq!(second.try_recv().ok(), Some(known(id)));
        assert!(first.try_recv().is_err());

        registry.notify(&known(id));
        assert!(first.try_recv().is_ok());
        assert!(second.try_recv().is_ok());
    }

    #[test]
    fn test_closed_subscriber_is_dropped_on_notify() {
        let id = CoValueId::from_bytes([2; 32]);
        let mut registry = SubscriptionRegistry::default();
        let (key, rx) = registry.add(id, None);
        let (_, _kept) = registry.add(id, None);
        drop(rx);

        registry.notify(&known(id));
        assert_eq!(registry.count(&id), 1);
        registry.remove(&id, key);
        assert_eq!(registry.count(&id), 1);
    }
}
