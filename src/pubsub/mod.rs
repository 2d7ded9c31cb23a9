//! Broadcast Transport Module
//!
//! Topic-based publish/subscribe used by the processing layer to exchange queue
//! snapshots, ownership requests and subtask results between peers.
//!
//! ## Implementations
//! - **`service`**: `GossipPubSub`, a UDP transport with SWIM-like membership
//!   (Join / Ping / Ack / Suspect / Alive) and full fan-out of topic messages to alive peers.
//! - **`local`**: `LocalBus`, an in-process transport used to run several peers inside one
//!   process (simulations and tests).
//!
//! Every implementation delivers a publisher's own messages to its local subscribers as well,
//! and delivers asynchronously: `publish` never calls back into the subscriber.

pub mod local;
pub mod service;
pub mod types;

#[cfg(test)]
mod tests;

use dashmap::DashMap;
use tokio::sync::mpsc;

use types::NodeId;

/// Stream of raw payloads published on one topic.
pub type Subscription = mpsc::UnboundedReceiver<Vec<u8>>;

/// Publish/subscribe transport seen by the processing layer.
pub trait PubSub: Send + Sync {
    /// Identity of the local peer on this transport.
    fn local_node_id(&self) -> NodeId;

    /// Broadcasts `payload` to every subscriber of `topic`, including local ones.
    fn publish(&self, topic: &str, payload: Vec<u8>) -> anyhow::Result<()>;

    /// Registers a new local subscriber of `topic`.
    fn subscribe(&self, topic: &str) -> Subscription;

    /// Peers currently considered reachable (observability only).
    fn active_nodes(&self) -> Vec<NodeId>;
}

/// Local fan-out table: `topic -> subscriber senders`.
///
/// Closed subscriptions are pruned lazily on delivery.
#[derive(Default)]
pub struct TopicSubscribers {
    topics: DashMap<String, Vec<mpsc::UnboundedSender<Vec<u8>>>>,
}

impl TopicSubscribers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, topic: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.topics.entry(topic.to_string()).or_default().push(tx);
        rx
    }

    /// Delivers a payload to all live subscribers of `topic`.
    /// Returns the number of subscribers that received it.
    pub fn deliver(&self, topic: &str, payload: &[u8]) -> usize {
        let Some(mut senders) = self.topics.get_mut(topic) else {
            return 0;
        };

        senders.retain(|tx| tx.send(payload.to_vec()).is_ok());
        senders.len()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|senders| senders.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    pub fn clear(&self) {
        self.topics.clear();
    }
}
