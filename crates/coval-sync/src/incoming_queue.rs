//! Incoming messages queue.
//!
//! One FIFO per peer, pulled round-robin so a chatty peer cannot starve
//! the others. Processing is budgeted: after running for longer than the
//! budget without a break, [`ProcessingBudget::tick`] yields to the runtime.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use crate::messages::SyncMessage;
use crate::transport::PeerId;

/// Round-robin queue of messages from many peers.
///
/// Entries are usually bare [`SyncMessage`]s; a node that needs to know
/// which connection a message came in on queues `(connection, message)`.
#[derive(Debug)]
pub struct IncomingMessagesQueue<M = SyncMessage> {
    /// Peers with pending messages, in rotation order.
    order: Vec<PeerId>,
    queues: HashMap<PeerId, VecDeque<M>>,
    cursor: usize,
}

impl<M> Default for IncomingMessagesQueue<M> {
    fn default() -> Self {
        Self {
            order: Vec::new(),
            queues: HashMap::new(),
            cursor: 0,
        }
    }
}

impl<M> IncomingMessagesQueue<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a message from `peer`.
    pub fn push(&mut self, peer: PeerId, msg: M) {
        match self.queues.get_mut(&peer) {
            Some(queue) => queue.push_back(msg),
            None => {
                self.order.push(peer.clone());
                self.queues.insert(peer, VecDeque::from([msg]));
            }
        }
    }

    /// Next message, taking turns between peers.
    ///
    /// A peer whose queue drains leaves the rotation.
    pub fn pull(&mut self) -> Option<(PeerId, M)> {
        if self.order.is_empty() {
            return None;
        }
        let idx = self.cursor % self.order.len();
        let peer = self.order[idx].clone();
        let queue = self.queues.get_mut(&peer)?;
        let msg = queue.pop_front()?;

        if queue.is_empty() {
            self.queues.remove(&peer);
            self.order.remove(idx);
            // The next peer slid into `idx`.
            self.cursor = idx;
        } else {
            self.cursor = idx + 1;
        }
        Some((peer, msg))
    }

    /// Drop everything queued from `peer`.
    pub fn remove_peer(&mut self, peer: &PeerId) {
        if self.queues.remove(peer).is_some() {
            if let Some(idx) = self.order.iter().position(|p| p == peer) {
                self.order.remove(idx);
                if idx < self.cursor {
                    self.cursor -= 1;
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Tracks uninterrupted processing time and yields once it runs over.
#[derive(Debug)]
pub struct ProcessingBudget {
    budget: Duration,
    started: Instant,
}

impl ProcessingBudget {
    pub fn new(budget: Duration) -> Self {
        Self {
            budget,
            started: Instant::now(),
        }
    }

    /// Yield to the runtime if the budget is spent. Returns whether it yielded.
    pub async fn tick(&mut self) -> bool {
        if self.started.elapsed() <= self.budget {
            return false;
        }
        trace!(budget_ms = self.budget.as_millis() as u64, "incoming queue yielding");
        tokio::task::yield_now().await;
        self.started = Instant::now();
        true
    }

    /// Start a fresh budget, e.g. after waiting for new messages.
    pub fn reset(&mut self) {
        self.started = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coval_core::CoValueId;
    use proptest::prelude::*;

    fn msg(n: u8) -> SyncMessage {
        SyncMessage::Done {
            id: CoValueId::from_bytes([n; 32]),
        }
    }

    fn tag(msg: &SyncMessage) -> u8 {
        msg.id().as_bytes()[0]
    }

    #[test]
    fn test_round_robin() {
        let mut queue = IncomingMessagesQueue::new();
        let a = PeerId::new("a");
        let b = PeerId::new("b");
        for n in 0..3 {
            queue.push(a.clone(), msg(n));
        }
        queue.push(b.clone(), msg(10));

        let pulled: Vec<_> = std::iter::from_fn(|| queue.pull())
            .map(|(peer, m)| (peer.0, tag(&m)))
            .collect();
        assert_eq!(
            pulled,
            vec![
                ("a".into(), 0),
                ("b".into(), 10),
                ("a".into(), 1),
                ("a".into(), 2)
            ]
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn test_entries_keep_their_tag() {
        let mut queue = IncomingMessagesQueue::new();
        let a = PeerId::new("a");
        queue.push(a.clone(), (7u64, msg(1)));
        queue.push(a.clone(), (8u64, msg(2)));

        let (peer, (connection, m)) = queue.pull().unwrap();
        assert_eq!(peer, a);
        assert_eq!((connection, tag(&m)), (7, 1));
        assert_eq!(queue.pull().map(|(_, (c, _))| c), Some(8));
    }

    #[test]
    fn test_remove_peer() {
        let mut queue = IncomingMessagesQueue::new();
        let a = PeerId::new("a");
        let b = PeerId::new("b");
        queue.push(a.clone(), msg(1));
        queue.push(b.clone(), msg(2));
        queue.push(a.clone(), msg(3));

        queue.remove_peer(&a);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pull().map(|(p, _)| p), Some(b));
        assert!(queue.pull().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_yields_after_running_over() {
        let mut budget = ProcessingBudget::new(Duration::from_millis(50));
        assert!(!budget.tick().await);
        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(budget.tick().await);
        assert!(!budget.tick().await);
    }

    proptest! {
        /// Pulls go in rounds: every peer with pending messages is served
        /// once per round, in arrival order, so none starves.
        #[test]
        fn prop_no_peer_starves(counts in prop::collection::vec(1usize..20, 1..6)) {
            let mut queue = IncomingMessagesQueue::new();
            let max = *counts.iter().max().unwrap();
            for round in 0..max {
                for (i, count) in counts.iter().enumerate() {
                    if round < *count {
                        queue.push(PeerId::new(format!("p{i}")), msg(round as u8));
                    }
                }
            }

            let mut expected = Vec::new();
            for round in 0..max {
                for (i, count) in counts.iter().enumerate() {
                    if round < *count {
                        expected.push((format!("p{i}"), round as u8));
                    }
                }
            }

            let pulled: Vec<_> = std::iter::from_fn(|| queue.pull())
                .map(|(peer, m)| (peer.0, tag(&m)))
                .collect();
            prop_assert_eq!(pulled, expected);
        }
    }
}
