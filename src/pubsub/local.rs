//! In-process transport.
//!
//! A `LocalBus` connects any number of `LocalPubSub` endpoints. Messages are pushed into
//! unbounded channels, so delivery is asynchronous with respect to the publisher, like the
//! network transport. Endpoints can be disconnected to simulate a crashed peer.

use super::types::NodeId;
use super::{PubSub, Subscription, TopicSubscribers};

use dashmap::DashMap;
use std::sync::Arc;

/// Shared medium of all local endpoints.
#[derive(Default)]
pub struct LocalBus {
    endpoints: DashMap<NodeId, Arc<TopicSubscribers>>,
}

impl LocalBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Creates (or re-attaches) the endpoint of `node_id`.
    pub fn endpoint(self: &Arc<Self>, node_id: NodeId) -> Arc<LocalPubSub> {
        let subscribers = self
            .endpoints
            .entry(node_id.clone())
            .or_insert_with(|| Arc::new(TopicSubscribers::new()))
            .clone();

        Arc::new(LocalPubSub {
            node_id,
            bus: self.clone(),
            subscribers,
        })
    }

    /// Detaches a peer: it stops receiving, and its publications are dropped.
    pub fn disconnect(&self, node_id: &NodeId) {
        if let Some((_, subscribers)) = self.endpoints.remove(node_id) {
            subscribers.clear();
            tracing::info!("Peer {} disconnected from local bus", node_id);
        }
    }

    pub fn connected_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.endpoints.iter().map(|e| e.key().clone()).collect();
        nodes.sort();
        nodes
    }

    fn broadcast(&self, from: &NodeId, topic: &str, payload: &[u8]) -> usize {
        if !self.endpoints.contains_key(from) {
            tracing::debug!("Dropping publication of disconnected peer {}", from);
            return 0;
        }

        self.endpoints
            .iter()
            .map(|entry| entry.value().deliver(topic, payload))
            .sum()
    }
}

/// One peer's view of a `LocalBus`.
pub struct LocalPubSub {
    node_id: NodeId,
    bus: Arc<LocalBus>,
    subscribers: Arc<TopicSubscribers>,
}

impl PubSub for LocalPubSub {
    fn local_node_id(&self) -> NodeId {
        self.node_id.clone()
    }

    fn publish(&self, topic: &str, payload: Vec<u8>) -> anyhow::Result<()> {
        let delivered = self.bus.broadcast(&self.node_id, topic, &payload);
        tracing::trace!("Published {} bytes on {} to {} subscribers", payload.len(), topic, delivered);
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> Subscription {
        self.subscribers.subscribe(topic)
    }

    fn active_nodes(&self) -> Vec<NodeId> {
        self.bus.connected_nodes()
    }
}
